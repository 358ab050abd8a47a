//! Device and service description documents.
//!
//! Fetches and parses the two description XML flavors into plain entry
//! structs: the device description found at the SSDP `LOCATION` (device
//! tree, icons, service list, optional `URLBase`) and each service's SCPD
//! (actions, arguments, state variables). Readers match element local names
//! only and skip anything unknown; required-field enforcement happens in the
//! [build step](crate::device), not here.

use std::str::FromStr;

use anyhow::Context;
use quick_xml::events::Event;
use url::Url;

use crate::error::{Error, Result};
use crate::{FromXml, XmlReaderExt};

/// Direction of an action argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(anyhow::anyhow!("expected in or out, got {s}")),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceDescription {
    pub url_base: Option<String>,
    pub device: DeviceEntry,
}

#[derive(Debug, Default)]
pub struct DeviceEntry {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub udn: Option<String>,
    pub upc: Option<String>,
    pub presentation_url: Option<String>,
    pub icons: Vec<IconEntry>,
    pub services: Vec<ServiceEntry>,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Default)]
pub struct ServiceEntry {
    pub service_type: Option<String>,
    pub service_id: Option<String>,
    pub scpd_url: Option<String>,
    pub control_url: Option<String>,
    pub event_sub_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct IconEntry {
    pub mimetype: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub depth: Option<u32>,
    pub url: Option<String>,
}

/// Parsed SCPD document.
#[derive(Debug, Default)]
pub struct Scpd {
    pub actions: Vec<ActionEntry>,
    pub state_variables: Vec<StateVariableEntry>,
}

#[derive(Debug, Default)]
pub struct ActionEntry {
    pub name: Option<String>,
    pub arguments: Vec<ArgumentEntry>,
}

#[derive(Debug, Default)]
pub struct ArgumentEntry {
    pub name: Option<String>,
    pub direction: Option<Direction>,
    pub related_state_variable: Option<String>,
}

#[derive(Debug)]
pub struct StateVariableEntry {
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub send_events: bool,
    pub default_value: Option<String>,
    pub allowed_values: Option<Vec<String>>,
    pub allowed_range: Option<AllowedRangeEntry>,
}

impl Default for StateVariableEntry {
    fn default() -> Self {
        Self {
            name: None,
            data_type: None,
            // absence of the attribute means the variable is evented
            send_events: true,
            default_value: None,
            allowed_values: None,
            allowed_range: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AllowedRangeEntry {
    pub minimum: Option<String>,
    pub maximum: Option<String>,
    pub step: Option<String>,
}

impl<'a> FromXml<'a> for DeviceDescription {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(
            root.local_name().as_ref() == b"root",
            "expected root element, got {:?}",
            root
        );
        let mut url_base = None;
        let mut device = None;
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"URLBase" => url_base = Some(r.read_text(start.name())?.trim().to_string()),
                    b"device" => device = Some(DeviceEntry::read_xml(r)?),
                    _ => {
                        r.read_to_end(start.name())?;
                    }
                },
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"root");
                    break;
                }
                _ => {}
            }
        }
        Ok(Self {
            url_base,
            device: device.context("device element")?,
        })
    }
}

impl<'a> FromXml<'a> for DeviceEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut entry = DeviceEntry::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"deviceType" => {
                            entry.device_type = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"friendlyName" => {
                            entry.friendly_name = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"manufacturer" => {
                            entry.manufacturer = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"manufacturerURL" => {
                            entry.manufacturer_url = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"modelDescription" => {
                            entry.model_description = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"modelName" => {
                            entry.model_name = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"modelNumber" => {
                            entry.model_number = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"modelURL" => {
                            entry.model_url = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"serialNumber" => {
                            entry.serial_number = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"UDN" => entry.udn = Some(r.read_text(name)?.trim().to_string()),
                        b"UPC" => entry.upc = Some(r.read_text(name)?.trim().to_string()),
                        b"presentationURL" => {
                            entry.presentation_url = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"iconList" => loop {
                            match r.read_event_err_eof()? {
                                Event::Start(start) => {
                                    anyhow::ensure!(start.local_name().as_ref() == b"icon");
                                    entry.icons.push(IconEntry::read_xml(r)?);
                                }
                                Event::End(end) => {
                                    anyhow::ensure!(end.local_name().as_ref() == b"iconList");
                                    break;
                                }
                                _ => {}
                            }
                        },
                        b"serviceList" => loop {
                            match r.read_event_err_eof()? {
                                Event::Start(start) => {
                                    anyhow::ensure!(start.local_name().as_ref() == b"service");
                                    entry.services.push(ServiceEntry::read_xml(r)?);
                                }
                                Event::End(end) => {
                                    anyhow::ensure!(end.local_name().as_ref() == b"serviceList");
                                    break;
                                }
                                _ => {}
                            }
                        },
                        b"deviceList" => loop {
                            match r.read_event_err_eof()? {
                                Event::Start(start) => {
                                    anyhow::ensure!(start.local_name().as_ref() == b"device");
                                    entry.devices.push(DeviceEntry::read_xml(r)?);
                                }
                                Event::End(end) => {
                                    anyhow::ensure!(end.local_name().as_ref() == b"deviceList");
                                    break;
                                }
                                _ => {}
                            }
                        },
                        _ => {
                            r.read_to_end(name)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(
                        end.local_name().as_ref() == b"device",
                        "expected device end, got {:?}",
                        end
                    );
                    break;
                }
                _ => {}
            }
        }
        Ok(entry)
    }
}

impl<'a> FromXml<'a> for ServiceEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut entry = ServiceEntry::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"serviceType" => {
                            entry.service_type = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"serviceId" => {
                            entry.service_id = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"SCPDURL" => entry.scpd_url = Some(r.read_text(name)?.trim().to_string()),
                        b"controlURL" => {
                            entry.control_url = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"eventSubURL" => {
                            entry.event_sub_url = Some(r.read_text(name)?.trim().to_string())
                        }
                        _ => {
                            r.read_to_end(name)?;
                        }
                    }
                }
                // non-evented services ship an empty <eventSubURL/>
                Event::Empty(start) => match start.local_name().as_ref() {
                    b"serviceType" => entry.service_type = Some(String::new()),
                    b"serviceId" => entry.service_id = Some(String::new()),
                    b"SCPDURL" => entry.scpd_url = Some(String::new()),
                    b"controlURL" => entry.control_url = Some(String::new()),
                    b"eventSubURL" => entry.event_sub_url = Some(String::new()),
                    _ => {}
                },
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"service");
                    break;
                }
                _ => {}
            }
        }
        Ok(entry)
    }
}

impl<'a> FromXml<'a> for IconEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut entry = IconEntry::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"mimetype" => entry.mimetype = Some(r.read_text(name)?.trim().to_string()),
                        b"width" => entry.width = r.read_text(name)?.trim().parse().ok(),
                        b"height" => entry.height = r.read_text(name)?.trim().parse().ok(),
                        b"depth" => entry.depth = r.read_text(name)?.trim().parse().ok(),
                        b"url" => entry.url = Some(r.read_text(name)?.trim().to_string()),
                        _ => {
                            r.read_to_end(name)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"icon");
                    break;
                }
                _ => {}
            }
        }
        Ok(entry)
    }
}

impl<'a> FromXml<'a> for Scpd {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(
            root.local_name().as_ref() == b"scpd",
            "expected scpd element, got {:?}",
            root
        );
        let mut scpd = Scpd::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"actionList" => loop {
                        match r.read_event_err_eof()? {
                            Event::Start(start) => {
                                anyhow::ensure!(start.local_name().as_ref() == b"action");
                                scpd.actions.push(ActionEntry::read_xml(r)?);
                            }
                            Event::End(end) => {
                                anyhow::ensure!(end.local_name().as_ref() == b"actionList");
                                break;
                            }
                            _ => {}
                        }
                    },
                    b"serviceStateTable" => loop {
                        match r.read_event_err_eof()? {
                            Event::Start(start) => {
                                anyhow::ensure!(start.local_name().as_ref() == b"stateVariable");
                                let send_events = start
                                    .attributes()
                                    .flatten()
                                    .find(|a| a.key.local_name().as_ref() == b"sendEvents")
                                    .map(|a| a.unescape_value().map(|v| v.to_string()))
                                    .transpose()
                                    .context("unescape sendEvents")?;
                                let mut entry = StateVariableEntry::read_xml(r)?;
                                entry.send_events =
                                    send_events.is_none_or(|v| !v.eq_ignore_ascii_case("no"));
                                scpd.state_variables.push(entry);
                            }
                            Event::End(end) => {
                                anyhow::ensure!(
                                    end.local_name().as_ref() == b"serviceStateTable"
                                );
                                break;
                            }
                            _ => {}
                        }
                    },
                    _ => {
                        r.read_to_end(start.name())?;
                    }
                },
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"scpd");
                    break;
                }
                _ => {}
            }
        }
        Ok(scpd)
    }
}

impl<'a> FromXml<'a> for ActionEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut entry = ActionEntry::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"name" => entry.name = Some(r.read_text(name)?.trim().to_string()),
                        b"argumentList" => loop {
                            match r.read_event_err_eof()? {
                                Event::Start(start) => {
                                    anyhow::ensure!(start.local_name().as_ref() == b"argument");
                                    entry.arguments.push(ArgumentEntry::read_xml(r)?);
                                }
                                Event::End(end) => {
                                    anyhow::ensure!(
                                        end.local_name().as_ref() == b"argumentList"
                                    );
                                    break;
                                }
                                _ => {}
                            }
                        },
                        _ => {
                            r.read_to_end(name)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"action");
                    break;
                }
                _ => {}
            }
        }
        Ok(entry)
    }
}

impl<'a> FromXml<'a> for ArgumentEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut entry = ArgumentEntry::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"name" => entry.name = Some(r.read_text(name)?.trim().to_string()),
                        b"direction" => {
                            entry.direction = Some(r.read_text(name)?.trim().parse()?)
                        }
                        b"relatedStateVariable" => {
                            entry.related_state_variable =
                                Some(r.read_text(name)?.trim().to_string())
                        }
                        _ => {
                            r.read_to_end(name)?;
                        }
                    }
                }
                // <retval/>
                Event::Empty(_) => {}
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"argument");
                    break;
                }
                _ => {}
            }
        }
        Ok(entry)
    }
}

impl<'a> FromXml<'a> for StateVariableEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut entry = StateVariableEntry::default();
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"name" => entry.name = Some(r.read_text(name)?.trim().to_string()),
                        b"dataType" => {
                            entry.data_type = Some(r.read_text(name)?.trim().to_string())
                        }
                        b"defaultValue" => {
                            entry.default_value = Some(r.read_text(name)?.to_string())
                        }
                        b"allowedValueList" => {
                            let mut values = Vec::new();
                            loop {
                                match r.read_event_err_eof()? {
                                    Event::Start(start) => {
                                        anyhow::ensure!(
                                            start.local_name().as_ref() == b"allowedValue"
                                        );
                                        values.push(r.read_text(start.name())?.to_string());
                                    }
                                    Event::Empty(_) => values.push(String::new()),
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"allowedValueList"
                                        );
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            entry.allowed_values = Some(values);
                        }
                        b"allowedValueRange" => {
                            let mut range = AllowedRangeEntry::default();
                            loop {
                                match r.read_event_err_eof()? {
                                    Event::Start(start) => {
                                        let name = start.name();
                                        match start.local_name().as_ref() {
                                            b"minimum" => {
                                                range.minimum =
                                                    Some(r.read_text(name)?.trim().to_string())
                                            }
                                            b"maximum" => {
                                                range.maximum =
                                                    Some(r.read_text(name)?.trim().to_string())
                                            }
                                            b"step" => {
                                                range.step =
                                                    Some(r.read_text(name)?.trim().to_string())
                                            }
                                            _ => {
                                                r.read_to_end(name)?;
                                            }
                                        }
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"allowedValueRange"
                                        );
                                        break;
                                    }
                                    _ => {}
                                }
                            }
                            entry.allowed_range = Some(range);
                        }
                        _ => {
                            r.read_to_end(name)?;
                        }
                    }
                }
                Event::Empty(start) => {
                    if start.local_name().as_ref() == b"defaultValue" {
                        entry.default_value = Some(String::new());
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"stateVariable");
                    break;
                }
                _ => {}
            }
        }
        Ok(entry)
    }
}

pub(crate) async fn fetch_xml(client: &reqwest::Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::Transport(format!("GET {url}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Transport(format!("GET {url}: status {status}")));
    }
    response
        .text()
        .await
        .map_err(|e| Error::Transport(format!("GET {url}: {e}")))
}

pub(crate) async fn fetch_device_description(
    client: &reqwest::Client,
    location: &Url,
) -> Result<DeviceDescription> {
    let xml = fetch_xml(client, location).await?;
    let mut reader = quick_xml::Reader::from_str(&xml);
    DeviceDescription::read_xml(&mut reader)
        .map_err(|e| Error::Malformed(format!("device description {location}: {e:#}")))
}

pub(crate) async fn fetch_scpd(client: &reqwest::Client, url: &Url) -> Result<Scpd> {
    let xml = fetch_xml(client, url).await?;
    let mut reader = quick_xml::Reader::from_str(&xml);
    Scpd::read_xml(&mut reader).map_err(|e| Error::Malformed(format!("scpd {url}: {e:#}")))
}
