//! Shared fixtures for unit tests: a canned device + SCPD description pair,
//! SSDP messages, and a minimal codec-backed HTTP server on a loopback port.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use crate::description::{DeviceDescription, DeviceEntry, Scpd};
use crate::device::{Device, DeviceBuild, ServiceBuild};
use crate::http::{self, HttpRequest};
use crate::ssdp::SsdpMessage;
use crate::FromXml;

pub(crate) const SAMPLE_UDN: &str = "uuid:11111111-1111-1111-1111-111111111111";

pub(crate) fn device_xml(url_base: Option<&str>) -> String {
    let url_base = url_base
        .map(|base| format!("<URLBase>{base}</URLBase>"))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  {url_base}
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>Living Room</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>Streamer 9</modelName>
    <UDN>{SAMPLE_UDN}</UDN>
    <iconList>
      <icon>
        <mimetype>image/png</mimetype>
        <width>48</width><height>48</height><depth>24</depth>
        <url>/icon.png</url>
      </icon>
    </iconList>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>
        <SCPDURL>/cd/scpd.xml</SCPDURL>
        <controlURL>/cd/control</controlURL>
        <eventSubURL>/cd/event</eventSubURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <friendlyName>WAN</friendlyName>
        <UDN>uuid:22222222-2222-2222-2222-222222222222</UDN>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
            <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
            <SCPDURL>/wan/scpd.xml</SCPDURL>
            <controlURL>/wan/control</controlURL>
            <eventSubURL>/wan/event</eventSubURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#
    )
}

pub(crate) const SCPD_XML: &str = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <actionList>
    <action>
      <name>Browse</name>
      <argumentList>
        <argument><name>ObjectID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_ObjectID</relatedStateVariable></argument>
        <argument><name>BrowseFlag</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_BrowseFlag</relatedStateVariable></argument>
        <argument><name>Filter</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_Filter</relatedStateVariable></argument>
        <argument><name>StartingIndex</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_Index</relatedStateVariable></argument>
        <argument><name>RequestedCount</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_Count</relatedStateVariable></argument>
        <argument><name>SortCriteria</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_SortCriteria</relatedStateVariable></argument>
        <argument><name>Result</name><direction>out</direction><relatedStateVariable>A_ARG_TYPE_Result</relatedStateVariable></argument>
        <argument><name>NumberReturned</name><direction>out</direction><relatedStateVariable>A_ARG_TYPE_Count</relatedStateVariable></argument>
        <argument><name>TotalMatches</name><direction>out</direction><relatedStateVariable>A_ARG_TYPE_Count</relatedStateVariable></argument>
        <argument><name>UpdateID</name><direction>out</direction><relatedStateVariable>A_ARG_TYPE_UpdateID</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="no">
      <name>A_ARG_TYPE_ObjectID</name>
      <dataType>string</dataType>
      <defaultValue>0</defaultValue>
    </stateVariable>
    <stateVariable sendEvents="no">
      <name>A_ARG_TYPE_BrowseFlag</name>
      <dataType>string</dataType>
      <allowedValueList>
        <allowedValue>BrowseMetadata</allowedValue>
        <allowedValue>BrowseDirectChildren</allowedValue>
      </allowedValueList>
    </stateVariable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_Filter</name><dataType>string</dataType></stateVariable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_Index</name><dataType>ui4</dataType></stateVariable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_Count</name><dataType>ui4</dataType></stateVariable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_SortCriteria</name><dataType>string</dataType></stateVariable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_Result</name><dataType>string</dataType></stateVariable>
    <stateVariable sendEvents="no"><name>A_ARG_TYPE_UpdateID</name><dataType>ui4</dataType></stateVariable>
    <stateVariable>
      <name>SystemUpdateID</name>
      <dataType>ui4</dataType>
      <allowedValueRange><minimum>0</minimum><maximum>4294967295</maximum><step>1</step></allowedValueRange>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;

pub(crate) fn alive_message() -> SsdpMessage {
    alive_message_with_max_age(1800)
}

pub(crate) fn alive_message_with_max_age(secs: u64) -> SsdpMessage {
    let raw = format!(
        "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age={secs}\r\n\
LOCATION: http://192.0.2.10:2869/desc.xml\r\n\
NT: upnp:rootdevice\r\n\
NTS: ssdp:alive\r\n\
SERVER: Foo/1.0\r\n\
USN: {SAMPLE_UDN}::upnp:rootdevice\r\n\r\n"
    );
    SsdpMessage::parse(
        Ipv4Addr::new(192, 0, 2, 3),
        SocketAddr::from(([192, 0, 2, 10], 50000)),
        raw.as_bytes(),
    )
    .expect("fixture message parses")
}

fn parse_scpd(xml: &str) -> Scpd {
    let mut r = quick_xml::Reader::from_str(xml);
    Scpd::read_xml(&mut r).expect("fixture scpd parses")
}

fn make_build(mut entry: DeviceEntry, scpd_xml: &str) -> DeviceBuild {
    let services = std::mem::take(&mut entry.services)
        .into_iter()
        .map(|se| ServiceBuild {
            entry: se,
            scpd: parse_scpd(scpd_xml),
        })
        .collect();
    let embedded = std::mem::take(&mut entry.devices)
        .into_iter()
        .map(|de| make_build(de, scpd_xml))
        .collect();
    DeviceBuild {
        entry,
        services,
        embedded,
    }
}

pub(crate) fn build_device(
    location: &str,
    device_desc_xml: &str,
    scpd_xml: &str,
) -> crate::Result<Device> {
    build_device_with_message(location, device_desc_xml, scpd_xml, alive_message())
}

pub(crate) fn build_device_with_message(
    location: &str,
    device_desc_xml: &str,
    scpd_xml: &str,
    message: SsdpMessage,
) -> crate::Result<Device> {
    let mut r = quick_xml::Reader::from_str(device_desc_xml);
    let desc = DeviceDescription::read_xml(&mut r).expect("fixture description parses");
    let build = make_build(desc.device, scpd_xml);
    Device::build(
        Url::parse(location).expect("fixture location parses"),
        desc.url_base.as_deref(),
        build,
        message,
    )
}

pub(crate) fn sample_device() -> Device {
    build_device(
        "http://192.0.2.10:2869/desc.xml",
        &device_xml(Some("http://192.0.2.10:2869/")),
        SCPD_XML,
    )
    .expect("sample device builds")
}

pub(crate) fn sample_device_at(location: &str, url_base: Option<&str>) -> Device {
    build_device(location, &device_xml(url_base), SCPD_XML).expect("sample device builds")
}

/// The sample device with every URL rebased onto a local test server.
pub(crate) fn sample_device_served_by(addr: SocketAddr) -> Device {
    let base = format!("http://{addr}/");
    build_device(
        &format!("http://{addr}/desc.xml"),
        &device_xml(Some(&base)),
        SCPD_XML,
    )
    .expect("sample device builds")
}

pub(crate) fn sample_device_with_scpd(scpd_xml: &str) -> crate::Result<Device> {
    build_device(
        "http://192.0.2.10:2869/desc.xml",
        &device_xml(Some("http://192.0.2.10:2869/")),
        scpd_xml,
    )
}

pub(crate) fn sample_device_missing_control_url() -> crate::Result<Device> {
    let xml = format!(
        r#"<root>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>Broken</friendlyName>
    <UDN>{SAMPLE_UDN}</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>
        <SCPDURL>/cd/scpd.xml</SCPDURL>
        <eventSubURL>/cd/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#
    );
    build_device("http://192.0.2.10:2869/desc.xml", &xml, SCPD_XML)
}

/// Formats a canned response with correct framing.
pub(crate) fn xml_response(status: u16, body: &str) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        500 => "Internal Server Error",
        _ => "Whatever",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
CONTENT-TYPE: text/xml; charset=\"utf-8\"\r\n\
CONTENT-LENGTH: {}\r\n\
CONNECTION: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub(crate) fn header_response(status: u16, headers: &[(&str, &str)]) -> Vec<u8> {
    let reason = match status {
        200 => "OK",
        412 => "Precondition Failed",
        _ => "Whatever",
    };
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("CONTENT-LENGTH: 0\r\nCONNECTION: close\r\n\r\n");
    out.into_bytes()
}

pub(crate) struct ServerGuard(JoinHandle<()>);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One-request-per-connection HTTP server answering with whatever the
/// handler returns. Served requests are recorded in arrival order.
pub(crate) async fn spawn_http_server<F>(
    handler: F,
) -> (SocketAddr, Arc<Mutex<Vec<HttpRequest>>>, ServerGuard)
where
    F: Fn(&HttpRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let request = match http::read_request(&mut stream).await {
                Ok(request) => request,
                Err(_) => continue,
            };
            let response = handler(&request);
            recorded.lock().push(request);
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        }
    });
    (addr, requests, ServerGuard(task))
}
