//! The entity graph a discovered device turns into.
//!
//! Built once from fetched description documents, immutable afterwards: a
//! [`Device`] owns its [`Service`]s (and embedded devices), a service owns
//! its [`Action`]s and [`StateVariable`]s, an [`Argument`] refers to a
//! sibling state variable by name. The only mutable cells are the device's
//! presence (latest SSDP message + expiry) and each service's subscription
//! state, both behind short-lived locks.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use url::Url;

use crate::description::{
    DeviceEntry, Direction, IconEntry, Scpd, ServiceEntry,
};
use crate::error::{Error, Result};
use crate::ssdp::SsdpMessage;

/// Fetched inputs for one device node: its description entry plus the SCPD
/// of every service, embedded devices recursively.
#[derive(Debug)]
pub(crate) struct DeviceBuild {
    pub entry: DeviceEntry,
    pub services: Vec<ServiceBuild>,
    pub embedded: Vec<DeviceBuild>,
}

#[derive(Debug)]
pub(crate) struct ServiceBuild {
    pub entry: ServiceEntry,
    pub scpd: Scpd,
}

#[derive(Debug, Clone)]
struct Presence {
    message: SsdpMessage,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct Device {
    udn: String,
    location: Url,
    device_type: String,
    friendly_name: String,
    manufacturer: Option<String>,
    manufacturer_url: Option<String>,
    model_description: Option<String>,
    model_name: Option<String>,
    model_number: Option<String>,
    model_url: Option<String>,
    serial_number: Option<String>,
    upc: Option<String>,
    presentation_url: Option<String>,
    icons: Vec<Icon>,
    services: Vec<Arc<Service>>,
    embedded: Vec<Device>,
    presence: Mutex<Presence>,
}

impl Device {
    /// Builds the graph out of fetched descriptions. Fails on missing
    /// required fields, unresolvable URLs, or an argument referencing an
    /// unknown state variable.
    pub(crate) fn build(
        location: Url,
        url_base: Option<&str>,
        build: DeviceBuild,
        message: SsdpMessage,
    ) -> Result<Device> {
        let base = match url_base {
            Some(base) => Url::parse(base)
                .map_err(|e| Error::Build(format!("bad URLBase {base:?}: {e}")))?,
            None => location.clone(),
        };
        Self::build_node(&base, &location, build, &message)
    }

    fn build_node(
        base: &Url,
        location: &Url,
        build: DeviceBuild,
        message: &SsdpMessage,
    ) -> Result<Device> {
        let entry = build.entry;
        let udn = required(entry.udn, "device UDN")?;
        let friendly_name = required(entry.friendly_name, "device friendlyName")?;
        let device_type = required(entry.device_type, "device deviceType")?;

        let services = build
            .services
            .into_iter()
            .map(|sb| Service::build(base, &udn, sb).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let embedded = build
            .embedded
            .into_iter()
            .map(|db| Self::build_node(base, location, db, message))
            .collect::<Result<Vec<_>>>()?;

        let icons = entry
            .icons
            .into_iter()
            .filter_map(|icon| Icon::build(base, icon))
            .collect();

        let expires_at = Instant::now() + Duration::from_secs(message.max_age());
        Ok(Device {
            udn,
            location: location.clone(),
            device_type,
            friendly_name,
            manufacturer: entry.manufacturer,
            manufacturer_url: entry.manufacturer_url,
            model_description: entry.model_description,
            model_name: entry.model_name,
            model_number: entry.model_number,
            model_url: entry.model_url,
            serial_number: entry.serial_number,
            upc: entry.upc,
            presentation_url: entry.presentation_url,
            icons,
            services,
            embedded,
            presence: Mutex::new(Presence {
                message: message.clone(),
                expires_at,
            }),
        })
    }

    pub fn udn(&self) -> &str {
        &self.udn
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    pub fn manufacturer_url(&self) -> Option<&str> {
        self.manufacturer_url.as_deref()
    }

    pub fn model_description(&self) -> Option<&str> {
        self.model_description.as_deref()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn model_number(&self) -> Option<&str> {
        self.model_number.as_deref()
    }

    pub fn model_url(&self) -> Option<&str> {
        self.model_url.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn upc(&self) -> Option<&str> {
        self.upc.as_deref()
    }

    pub fn presentation_url(&self) -> Option<&str> {
        self.presentation_url.as_deref()
    }

    pub fn icons(&self) -> &[Icon] {
        &self.icons
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    pub fn embedded_devices(&self) -> &[Device] {
        &self.embedded
    }

    /// This device's services followed by every embedded device's,
    /// depth-first.
    pub fn all_services(&self) -> Box<dyn Iterator<Item = &Arc<Service>> + '_> {
        let own = self.services.iter();
        let nested = self.embedded.iter().flat_map(|d| d.all_services());
        Box::new(own.chain(nested))
    }

    pub fn find_service(&self, service_id: &str) -> Option<Arc<Service>> {
        self.all_services()
            .find(|s| s.service_id() == service_id)
            .cloned()
    }

    pub fn find_service_by_type(&self, service_type: &str) -> Option<Arc<Service>> {
        self.all_services()
            .find(|s| s.service_type() == service_type)
            .cloned()
    }

    /// The SSDP message that most recently refreshed this device.
    pub fn last_message(&self) -> SsdpMessage {
        self.presence.lock().message.clone()
    }

    pub fn expires_at(&self) -> Instant {
        self.presence.lock().expires_at
    }

    pub(crate) fn iface_addr(&self) -> Ipv4Addr {
        self.presence.lock().message.iface_addr()
    }

    /// Refreshes presence from a new advertisement. The expiry never moves
    /// backwards.
    pub(crate) fn refresh(&self, message: SsdpMessage) {
        let expires_at = Instant::now() + Duration::from_secs(message.max_age());
        let mut presence = self.presence.lock();
        presence.expires_at = presence.expires_at.max(expires_at);
        presence.message = message;
    }
}

#[derive(Debug, Clone)]
pub struct Icon {
    pub mimetype: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub url: Url,
}

impl Icon {
    fn build(base: &Url, entry: IconEntry) -> Option<Icon> {
        let icon = (|| {
            Some(Icon {
                mimetype: entry.mimetype?,
                width: entry.width?,
                height: entry.height?,
                depth: entry.depth?,
                url: base.join(&entry.url?).ok()?,
            })
        })();
        if icon.is_none() {
            tracing::debug!("dropping icon with incomplete declaration");
        }
        icon
    }
}

/// Subscription state of a service, while subscribed.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub sid: String,
    pub started: Instant,
    /// Advertised timeout in milliseconds; −1 means `infinite`.
    pub timeout_ms: i64,
}

impl Subscription {
    pub fn is_infinite(&self) -> bool {
        self.timeout_ms < 0
    }
}

#[derive(Debug)]
pub struct Service {
    udn: String,
    service_type: String,
    service_id: String,
    scpd_url: Url,
    control_url: Url,
    event_sub_url: Url,
    actions: Vec<Action>,
    state_variables: Vec<StateVariable>,
    subscription: Mutex<Option<Subscription>>,
}

impl Service {
    fn build(base: &Url, udn: &str, build: ServiceBuild) -> Result<Service> {
        let entry = build.entry;
        let service_type = required(entry.service_type, "serviceType")?;
        let service_id = required(entry.service_id, "serviceId")?;
        let scpd_url = resolve(base, &required(entry.scpd_url, "SCPDURL")?)?;
        let control_url = resolve(base, &required(entry.control_url, "controlURL")?)?;
        // non-evented services declare an empty eventSubURL; it still has to
        // be declared
        let event_sub_url = entry
            .event_sub_url
            .ok_or_else(|| Error::Build("missing eventSubURL".to_string()))?;
        let event_sub_url = resolve(base, &event_sub_url)?;

        let state_variables = build
            .scpd
            .state_variables
            .into_iter()
            .map(|entry| {
                Ok(StateVariable {
                    name: required(entry.name, "stateVariable name")?,
                    data_type: required(entry.data_type, "stateVariable dataType")?,
                    send_events: entry.send_events,
                    default_value: entry.default_value,
                    allowed_values: entry.allowed_values,
                    allowed_range: entry.allowed_range.map(|r| AllowedRange {
                        minimum: r.minimum,
                        maximum: r.maximum,
                        step: r.step,
                    }),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let actions = build
            .scpd
            .actions
            .into_iter()
            .map(|entry| {
                let name = required(entry.name, "action name")?;
                let arguments = entry
                    .arguments
                    .into_iter()
                    .map(|arg| {
                        let arg_name = required(arg.name, "argument name")?;
                        let direction = arg.direction.ok_or_else(|| {
                            Error::Build(format!(
                                "argument {arg_name} of {name} missing direction"
                            ))
                        })?;
                        let related = required(
                            arg.related_state_variable,
                            "argument relatedStateVariable",
                        )?;
                        if !state_variables.iter().any(|v| v.name == related) {
                            return Err(Error::Build(format!(
                                "argument {arg_name} of {name} references unknown state variable {related}"
                            )));
                        }
                        Ok(Argument {
                            name: arg_name,
                            direction,
                            related_state_variable: related,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Action { name, arguments })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Service {
            udn: udn.to_string(),
            service_type,
            service_id,
            scpd_url,
            control_url,
            event_sub_url,
            actions,
            state_variables,
            subscription: Mutex::new(None),
        })
    }

    /// UDN of the device (root or embedded) that declared this service.
    pub fn udn(&self) -> &str {
        &self.udn
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn scpd_url(&self) -> &Url {
        &self.scpd_url
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    pub fn event_sub_url(&self) -> &Url {
        &self.event_sub_url
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn state_variables(&self) -> &[StateVariable] {
        &self.state_variables
    }

    pub fn find_action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn find_state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.state_variables.iter().find(|v| v.name == name)
    }

    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription.lock().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }

    pub(crate) fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.lock() = Some(subscription);
    }

    pub(crate) fn clear_subscription(&self) {
        *self.subscription.lock() = None;
    }
}

#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    arguments: Vec<Argument>,
}

impl Action {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments in declaration order.
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn in_arguments(&self) -> impl Iterator<Item = &Argument> {
        self.arguments
            .iter()
            .filter(|a| a.direction == Direction::In)
    }

    pub fn out_arguments(&self) -> impl Iterator<Item = &Argument> {
        self.arguments
            .iter()
            .filter(|a| a.direction == Direction::Out)
    }
}

#[derive(Debug, Clone)]
pub struct Argument {
    name: String,
    direction: Direction,
    related_state_variable: String,
}

impl Argument {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Name of the related state variable; resolve it through
    /// [`Service::find_state_variable`].
    pub fn related_state_variable(&self) -> &str {
        &self.related_state_variable
    }
}

#[derive(Debug, Clone)]
pub struct StateVariable {
    name: String,
    data_type: String,
    send_events: bool,
    default_value: Option<String>,
    allowed_values: Option<Vec<String>>,
    allowed_range: Option<AllowedRange>,
}

impl StateVariable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn send_events(&self) -> bool {
        self.send_events
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn allowed_values(&self) -> Option<&[String]> {
        self.allowed_values.as_deref()
    }

    pub fn allowed_range(&self) -> Option<&AllowedRange> {
        self.allowed_range.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct AllowedRange {
    pub minimum: Option<String>,
    pub maximum: Option<String>,
    pub step: Option<String>,
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Build(format!("missing {what}"))),
    }
}

fn resolve(base: &Url, declared: &str) -> Result<Url> {
    base.join(declared)
        .map_err(|e| Error::Build(format!("cannot resolve {declared:?} against {base}: {e}")))
}
