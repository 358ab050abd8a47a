//! SOAP action invocation.
//!
//! Builds the request envelope from an action's declared IN arguments,
//! POSTs it to the service's control URL and parses either the
//! `<ActionName>Response` element or the fault envelope out of the reply.

use std::collections::HashMap;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::device::{Action, Service};
use crate::error::{Error, Result};
use crate::XmlReaderExt;

/// A fault envelope returned by a device.
#[derive(Debug, Clone)]
pub struct SoapFault {
    pub fault_code: String,
    pub fault_string: String,
    /// `UPnPError/errorCode`; its presence is what makes a fault well-formed.
    pub error_code: u16,
    pub error_description: Option<String>,
    /// Every `<detail>/<UPnPError>` child as parsed, in document order.
    pub detail: Vec<(String, String)>,
}

impl SoapFault {
    /// Flattens the fault the way callers opting into fault-map results see
    /// it: `faultcode`, `faultstring` and `UPnPError/<child>` keys.
    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("faultcode".to_string(), self.fault_code);
        map.insert("faultstring".to_string(), self.fault_string);
        for (name, value) in self.detail {
            map.insert(format!("UPnPError/{name}"), value);
        }
        map
    }
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UPnPError {}", self.error_code)?;
        if let Some(description) = &self.error_description {
            write!(f, ": {description}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SoapFault {}

enum Outcome {
    Response(HashMap<String, String>),
    Fault(SoapFault),
}

/// Invokes actions against service control URLs.
#[derive(Debug, Clone)]
pub struct SoapClient {
    http: reqwest::Client,
    user_agent: String,
}

impl SoapClient {
    pub fn new(http: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            http,
            user_agent: user_agent.into(),
        }
    }

    /// Invokes `action` with the given argument values. Missing IN arguments
    /// fall back to the related state variable's default, then to the empty
    /// string. A fault envelope surfaces as [`Error::Fault`].
    pub async fn invoke(
        &self,
        service: &Service,
        action: &Action,
        args: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        match self.invoke_inner(service, action, args).await? {
            Outcome::Response(map) => Ok(map),
            Outcome::Fault(fault) => Err(Error::Fault(fault)),
        }
    }

    /// Like [`invoke`](Self::invoke), but a fault envelope is returned as
    /// the result map instead of failing.
    pub async fn invoke_keep_fault(
        &self,
        service: &Service,
        action: &Action,
        args: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        match self.invoke_inner(service, action, args).await? {
            Outcome::Response(map) => Ok(map),
            Outcome::Fault(fault) => Ok(fault.into_map()),
        }
    }

    async fn invoke_inner(
        &self,
        service: &Service,
        action: &Action,
        args: &HashMap<String, String>,
    ) -> Result<Outcome> {
        let body = build_envelope(service, action, args)
            .map_err(|e| Error::Malformed(format!("build soap envelope: {e}")))?;
        let soapaction = format!("\"{}#{}\"", service.service_type(), action.name());
        tracing::debug!(action = action.name(), url = %service.control_url(), "invoking action");
        let response = self
            .http
            .post(service.control_url().clone())
            .header("SOAPACTION", soapaction)
            .header("USER-AGENT", &self.user_agent)
            .header("CONNECTION", "close")
            .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        match status {
            200 if !text.is_empty() => {
                let map = parse_action_response(action, &text)
                    .map_err(|e| Error::Malformed(format!("soap response: {e:#}")))?;
                Ok(Outcome::Response(map))
            }
            500 if !text.is_empty() => {
                let fault = parse_fault(&text)
                    .map_err(|e| Error::Malformed(format!("soap fault: {e:#}")))?;
                tracing::debug!(action = action.name(), %fault, "action returned fault");
                Ok(Outcome::Fault(fault))
            }
            _ => Err(Error::Protocol(format!(
                "action {} returned status {status} with {} body bytes",
                action.name(),
                text.len()
            ))),
        }
    }
}

/// UTF-8 envelope, no XML declaration. IN arguments are written in
/// declaration order.
fn build_envelope(
    service: &Service,
    action: &Action,
    args: &HashMap<String, String>,
) -> quick_xml::Result<Vec<u8>> {
    let mut w = quick_xml::Writer::new(Vec::new());
    let envelope = BytesStart::new("s:Envelope").with_attributes([
        ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
        ("s:encodingStyle", "http://schemas.xmlsoap.org/soap/encoding/"),
    ]);
    w.write_event(Event::Start(envelope))?;
    w.write_event(Event::Start(BytesStart::new("s:Body")))?;

    let tag = format!("u:{}", action.name());
    let element =
        BytesStart::new(tag.as_str()).with_attributes([("xmlns:u", service.service_type())]);
    w.write_event(Event::Start(element))?;
    for argument in action.in_arguments() {
        let value = args
            .get(argument.name())
            .map(String::as_str)
            .or_else(|| {
                service
                    .find_state_variable(argument.related_state_variable())
                    .and_then(|v| v.default_value())
            })
            .unwrap_or("");
        w.create_element(argument.name())
            .write_text_content(BytesText::new(value))?;
    }
    w.write_event(Event::End(BytesEnd::new(tag.as_str())))?;

    w.write_event(Event::End(BytesEnd::new("s:Body")))?;
    w.write_event(Event::End(BytesEnd::new("s:Envelope")))?;
    Ok(w.into_inner())
}

/// Parses `<s:Body>/<ActionName>Response` children into a name → value map.
/// Names outside the declared OUT arguments are kept.
fn parse_action_response(action: &Action, xml: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut r = quick_xml::Reader::from_str(xml);
    let envelope = r.read_to_start()?;
    anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
    let body = r.read_to_start()?;
    anyhow::ensure!(body.local_name().as_ref() == b"Body");
    let response = r.read_to_start()?;
    let expected = format!("{}Response", action.name());
    anyhow::ensure!(
        response.local_name().as_ref() == expected.as_bytes(),
        "expected {expected}, got {:?}",
        response
    );
    let response_end = response.to_end().into_owned();

    let mut out = HashMap::new();
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) => {
                let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                let value = r.read_text(start.name())?;
                let unescaped = quick_xml::escape::unescape(&value)
                    .map(|v| v.into_owned())
                    .ok();
                let value = unescaped.unwrap_or_else(|| value.into_owned());
                if !action.out_arguments().any(|a| a.name() == name) {
                    tracing::debug!(
                        action = action.name(),
                        argument = %name,
                        "response argument not declared in scpd"
                    );
                }
                out.insert(name, value);
            }
            Event::Empty(start) => {
                let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                out.insert(name, String::new());
            }
            Event::End(end) if end == response_end => break,
            Event::Text(_) => {}
            other => anyhow::bail!("expected response argument, got {other:?}"),
        }
    }
    Ok(out)
}

/// Parses `<s:Body>/<s:Fault>`: `faultcode`, `faultstring` and the
/// `<detail>/<UPnPError>` children. A fault without `UPnPError/errorCode` is
/// malformed.
fn parse_fault(xml: &str) -> anyhow::Result<SoapFault> {
    let mut r = quick_xml::Reader::from_str(xml);
    let envelope = r.read_to_start()?;
    anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
    let body = r.read_to_start()?;
    anyhow::ensure!(body.local_name().as_ref() == b"Body");
    let fault = r.read_to_start()?;
    anyhow::ensure!(
        fault.local_name().as_ref() == b"Fault",
        "expected Fault, got {:?}",
        fault
    );
    let fault_end = fault.to_end().into_owned();

    let mut fault_code = None;
    let mut fault_string = None;
    let mut detail = Vec::new();
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) => match start.local_name().as_ref() {
                b"faultcode" => fault_code = Some(r.read_text(start.name())?.trim().to_string()),
                b"faultstring" => {
                    fault_string = Some(r.read_text(start.name())?.trim().to_string())
                }
                b"detail" => loop {
                    match r.read_event_err_eof()? {
                        Event::Start(inner) => {
                            if inner.local_name().as_ref() == b"UPnPError" {
                                loop {
                                    match r.read_event_err_eof()? {
                                        Event::Start(child) => {
                                            let name = String::from_utf8(
                                                child.local_name().as_ref().to_vec(),
                                            )?;
                                            let value =
                                                r.read_text(child.name())?.trim().to_string();
                                            detail.push((name, value));
                                        }
                                        Event::End(end)
                                            if end.local_name().as_ref() == b"UPnPError" =>
                                        {
                                            break
                                        }
                                        _ => {}
                                    }
                                }
                            } else {
                                r.read_to_end(inner.name())?;
                            }
                        }
                        Event::End(end) if end.local_name().as_ref() == b"detail" => break,
                        _ => {}
                    }
                },
                _ => {
                    r.read_to_end(start.name())?;
                }
            },
            Event::End(end) if end == fault_end => break,
            _ => {}
        }
    }

    let error_code = detail
        .iter()
        .find(|(name, _)| name == "errorCode")
        .and_then(|(_, value)| value.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("fault without UPnPError/errorCode"))?;
    let error_description = detail
        .iter()
        .find(|(name, _)| name == "errorDescription")
        .map(|(_, value)| value.clone());

    Ok(SoapFault {
        fault_code: fault_code.unwrap_or_default(),
        fault_string: fault_string.unwrap_or_default(),
        error_code,
        error_description,
        detail,
    })
}
