//! Event receiver: the local HTTP server devices deliver GENA NOTIFY
//! requests to.
//!
//! Binds an OS-chosen TCP port; that port goes into the `CALLBACK` URL of
//! SUBSCRIBE requests. Each connection carries exactly one request: read it
//! (30 s read timeout), validate the `NT`/`NTS`/`SID` headers, parse the
//! `<e:propertyset>` body, hand the (name, value) pairs to the dispatch
//! callback, answer, close.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quick_xml::events::Event;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::http::{self, Headers, HttpRequest, HttpResponse, Version};
use crate::XmlReaderExt;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Routes one notification to its subscription. Returns false to reject
/// (no such SID), which turns into a 412 on the wire.
pub(crate) type EventCallback =
    Arc<dyn Fn(&str, u64, Vec<(String, String)>) -> bool + Send + Sync>;

pub(crate) struct EventServer {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    callback: EventCallback,
}

impl EventServer {
    pub async fn bind(callback: EventCallback) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| Error::Transport(format!("bind event receiver: {e}")))?;
        let local_addr = listener.local_addr().map_err(Error::transport)?;
        tracing::debug!(%local_addr, "event receiver bound");
        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
            callback,
        })
    }

    /// Port that goes into CALLBACK URLs.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let listener = self.listener.clone();
        let callback = self.callback.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::trace!(%peer, "event connection");
                                tokio::spawn(handle_connection(stream, callback.clone()));
                            }
                            Err(e) => {
                                if cancel.is_cancelled() {
                                    break;
                                }
                                tracing::warn!("event accept failed: {e}");
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::trace!("event server done");
        })
    }
}

async fn handle_connection(mut stream: TcpStream, callback: EventCallback) {
    let request = match tokio::time::timeout(READ_TIMEOUT, http::read_request(&mut stream)).await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            tracing::trace!("unreadable event request: {e}");
            let _ = write_status(&mut stream, 400).await;
            return;
        }
        Err(_) => {
            tracing::trace!("event connection read timed out");
            return;
        }
    };
    let status = dispatch(&request, &callback);
    if let Err(e) = write_status(&mut stream, status).await {
        tracing::trace!("event response write failed: {e}");
    }
}

/// Validates a NOTIFY request and routes its property changes. Returns the
/// HTTP status to answer with.
pub(crate) fn dispatch(request: &HttpRequest, callback: &EventCallback) -> u16 {
    if request.method != "NOTIFY" {
        return 405;
    }
    let nt = request.headers.get("NT");
    let nts = request.headers.get("NTS");
    if nt.is_none() || nts.is_none() {
        return 400;
    }
    if nt != Some("upnp:event") || nts != Some("upnp:propchange") {
        return 412;
    }
    let Some(sid) = request.headers.get("SID").filter(|s| !s.is_empty()) else {
        return 412;
    };
    let properties = match parse_property_set(&request.body) {
        Ok(properties) => properties,
        Err(e) => {
            tracing::debug!(sid, "bad propertyset body: {e:#}");
            return 400;
        }
    };
    // SEQ is informational; the listener sees it, nothing is reordered
    let seq = request
        .headers
        .get("SEQ")
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    if callback(sid, seq, properties) {
        200
    } else {
        412
    }
}

/// Parses `<e:propertyset>` into (name, value) pairs in document order.
/// Namespaces are matched by local name only.
pub(crate) fn parse_property_set(body: &[u8]) -> anyhow::Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(body)?;
    let mut r = quick_xml::Reader::from_str(text);
    let root = r.read_to_start()?;
    anyhow::ensure!(
        root.local_name().as_ref() == b"propertyset",
        "expected propertyset, got {:?}",
        root
    );
    let mut properties = Vec::new();
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) if start.local_name().as_ref() == b"property" => loop {
                match r.read_event_err_eof()? {
                    Event::Start(variable) => {
                        let name =
                            String::from_utf8(variable.local_name().as_ref().to_vec())?;
                        let value = r.read_text(variable.name())?;
                        let unescaped = quick_xml::escape::unescape(&value)
                            .map(|v| v.into_owned())
                            .ok();
                        properties.push((name, unescaped.unwrap_or_else(|| value.into_owned())));
                    }
                    Event::Empty(variable) => {
                        let name =
                            String::from_utf8(variable.local_name().as_ref().to_vec())?;
                        properties.push((name, String::new()));
                    }
                    Event::End(end) if end.local_name().as_ref() == b"property" => break,
                    Event::Text(_) => {}
                    other => anyhow::bail!("expected property content, got {other:?}"),
                }
            },
            Event::Empty(_) => {}
            Event::Start(other) => {
                r.read_to_end(other.name())?;
            }
            Event::End(end) => {
                anyhow::ensure!(end.local_name().as_ref() == b"propertyset");
                break;
            }
            _ => {}
        }
    }
    Ok(properties)
}

async fn write_status(stream: &mut TcpStream, status: u16) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        412 => "Precondition Failed",
        _ => "",
    };
    let response = HttpResponse {
        version: Version::Http11,
        status,
        reason: reason.to_string(),
        headers: [("CONNECTION", "close"), ("CONTENT-LENGTH", "0")]
            .into_iter()
            .collect::<Headers>(),
        body: Vec::new(),
    };
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    const PROPERTYSET: &str = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><Variable>42</Variable></e:property></e:propertyset>"#;

    fn notify_request(headers: &[(&str, &str)], body: &str) -> HttpRequest {
        let mut all: Headers = headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        all.insert("CONTENT-LENGTH", body.len().to_string());
        HttpRequest {
            method: "NOTIFY".to_string(),
            target: "/uuid:x/serviceId".to_string(),
            version: Version::Http11,
            headers: all,
            body: body.as_bytes().to_vec(),
        }
    }

    fn accepting_callback() -> (EventCallback, Arc<Mutex<Vec<(String, u64, Vec<(String, String)>)>>>)
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let callback: EventCallback = Arc::new(move |sid, seq, props| {
            captured.lock().push((sid.to_string(), seq, props));
            true
        });
        (callback, seen)
    }

    #[test]
    fn parses_property_set_in_order() {
        let body = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><SystemUpdateID>7</SystemUpdateID></e:property>
  <e:property><ContainerUpdateIDs>0,12</ContainerUpdateIDs></e:property>
</e:propertyset>"#;
        let properties = parse_property_set(body.as_bytes()).unwrap();
        assert_eq!(
            properties,
            vec![
                ("SystemUpdateID".to_string(), "7".to_string()),
                ("ContainerUpdateIDs".to_string(), "0,12".to_string()),
            ]
        );
    }

    #[test]
    fn empty_property_set_is_fine() {
        let body = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"></e:propertyset>"#;
        assert_eq!(parse_property_set(body.as_bytes()).unwrap(), vec![]);
    }

    #[test]
    fn dispatch_fires_listener_with_seq() {
        let (callback, seen) = accepting_callback();
        let request = notify_request(
            &[
                ("NT", "upnp:event"),
                ("NTS", "upnp:propchange"),
                ("SID", "uuid:s1"),
                ("SEQ", "7"),
            ],
            PROPERTYSET,
        );
        assert_eq!(dispatch(&request, &callback), 200);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (sid, seq, props) = &seen[0];
        assert_eq!(sid, "uuid:s1");
        assert_eq!(*seq, 7);
        assert_eq!(props, &vec![("Variable".to_string(), "42".to_string())]);
    }

    #[test]
    fn dispatch_status_matrix() {
        let (callback, _) = accepting_callback();
        // NT or NTS missing -> 400
        let request = notify_request(&[("NTS", "upnp:propchange"), ("SID", "uuid:s1")], PROPERTYSET);
        assert_eq!(dispatch(&request, &callback), 400);
        let request = notify_request(&[("NT", "upnp:event"), ("SID", "uuid:s1")], PROPERTYSET);
        assert_eq!(dispatch(&request, &callback), 400);
        // wrong NT/NTS -> 412
        let request = notify_request(
            &[("NT", "upnp:event"), ("NTS", "ssdp:alive"), ("SID", "uuid:s1")],
            PROPERTYSET,
        );
        assert_eq!(dispatch(&request, &callback), 412);
        // SID missing -> 412
        let request = notify_request(&[("NT", "upnp:event"), ("NTS", "upnp:propchange")], PROPERTYSET);
        assert_eq!(dispatch(&request, &callback), 412);
        // broken body -> 400
        let request = notify_request(
            &[
                ("NT", "upnp:event"),
                ("NTS", "upnp:propchange"),
                ("SID", "uuid:s1"),
            ],
            "<notapropertyset/>",
        );
        assert_eq!(dispatch(&request, &callback), 400);
        // listener rejection -> 412
        let rejecting: EventCallback = Arc::new(|_, _, _| false);
        let request = notify_request(
            &[
                ("NT", "upnp:event"),
                ("NTS", "upnp:propchange"),
                ("SID", "uuid:unknown"),
            ],
            PROPERTYSET,
        );
        assert_eq!(dispatch(&request, &rejecting), 412);
    }

    #[test]
    fn missing_seq_dispatches_as_zero() {
        let (callback, seen) = accepting_callback();
        let request = notify_request(
            &[
                ("NT", "upnp:event"),
                ("NTS", "upnp:propchange"),
                ("SID", "uuid:s1"),
            ],
            PROPERTYSET,
        );
        assert_eq!(dispatch(&request, &callback), 200);
        assert_eq!(seen.lock()[0].1, 0);
    }

    async fn roundtrip(server_port: u16, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", server_port)).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_notify_over_tcp() {
        let (callback, seen) = accepting_callback();
        let server = EventServer::bind(callback).await.unwrap();
        let port = server.port();
        let cancel = CancellationToken::new();
        let task = server.start(cancel.clone());

        let raw = format!(
            "NOTIFY /uuid:x/serviceId HTTP/1.1\r\n\
HOST: 127.0.0.1:{port}\r\n\
NT: upnp:event\r\n\
NTS: upnp:propchange\r\n\
SID: uuid:s1\r\n\
SEQ: 7\r\n\
CONTENT-TYPE: text/xml\r\n\
CONTENT-LENGTH: {}\r\n\r\n{PROPERTYSET}",
            PROPERTYSET.len()
        );
        let response = roundtrip(port, raw.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0, "uuid:s1");
            assert_eq!(seen[0].1, 7);
            assert_eq!(seen[0].2, vec![("Variable".to_string(), "42".to_string())]);
        }

        // one more connection, this time without NT
        let raw = format!(
            "NOTIFY / HTTP/1.1\r\nNTS: upnp:propchange\r\nSID: uuid:s1\r\nCONTENT-LENGTH: {}\r\n\r\n{PROPERTYSET}",
            PROPERTYSET.len()
        );
        let response = roundtrip(port, raw.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");

        cancel.cancel();
        let _ = task.await;
    }
}
