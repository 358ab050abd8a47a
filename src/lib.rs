//! UPnP control point library.
//!
//! Discovers UPnP devices over SSDP, parses their description documents into
//! a typed [`Device`]/[`Service`]/[`Action`] graph, invokes actions over
//! SOAP and receives GENA state-variable change events while keeping
//! subscriptions renewed.
//!
//! The [`ControlPoint`] orchestrates everything:
//!
//! ```no_run
//! # async fn run() -> upnp_client::Result<()> {
//! let cp = upnp_client::ControlPoint::with_defaults()?;
//! cp.initialize()?;
//! cp.start().await?;
//! cp.search().await?;
//! # Ok(()) }
//! ```

pub mod control_point;
pub mod description;
pub mod device;
pub mod error;
pub mod event;
pub mod gena;
pub mod http;
pub mod interface;
pub mod soap;
pub mod ssdp;

#[cfg(test)]
pub(crate) mod test_util;

pub use control_point::{
    ControlPoint, ControlPointConfig, DiscoveryListener, NotifyEventListener, State,
};
pub use description::Direction;
pub use device::{
    Action, AllowedRange, Argument, Device, Icon, Service, StateVariable, Subscription,
};
pub use error::{Error, Result};
pub use interface::Iface;
pub use soap::{SoapClient, SoapFault};
pub use ssdp::{Nts, SsdpMessage};

/// Useful utility functions for [Reader](quick_xml::Reader)
pub(crate) trait XmlReaderExt<'a> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>>;
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>>;
}

impl<'a> XmlReaderExt<'a> for quick_xml::Reader<&'a [u8]> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Eof => Err(anyhow::anyhow!("early eof")),
            _ => Ok(event),
        }
    }

    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            if let quick_xml::events::Event::Start(e) = event {
                break Ok(e);
            }
        }
    }
}

/// Allows structs to deserialize themselves from an xml reader
pub(crate) trait FromXml<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;
}
