//! SDP session parsing and generation (RFC 4566 with the AES67 attribute
//! set).
//!
//! Parsing accepts CRLF or LF line endings. Lines of the form `<letter>=...`
//! are typed records; anything else is ignored. Unrecognized `a=` attributes
//! are retained on the descriptor so a foreign session survives a
//! parse/generate round trip. Generation is deterministic: records are
//! written in a fixed order, unknown attributes last in insertion order,
//! one `\n` per line.

use std::net::Ipv4Addr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::descriptor::{AudioEncoding, Direction, StreamDescriptor};
use crate::error::{BridgeError, DescriptorError, SdpError};

lazy_static! {
    static ref RTPMAP_RE: Regex = Regex::new(r"^(\d+) ([A-Za-z0-9]+)/(\d+)(?:/(\d+))?$")
        .expect("static pattern");
    static ref TS_REFCLK_RE: Regex =
        Regex::new(r"^ptp=IEEE1588-2008:(?:([0-9A-Fa-f:\-]+):)?domain-nmbr=(\d+)$")
            .expect("static pattern");
    static ref SOURCE_FILTER_RE: Regex =
        Regex::new(r"^\s*incl IN IP4 (\S+) (\S+)$").expect("static pattern");
}

/// Attributes the parser understands; everything else lands in
/// `extra_attributes`.
const KNOWN_ATTRIBUTES: &[&str] = &[
    "rtpmap",
    "ptime",
    "framecount",
    "source-filter",
    "ts-refclk",
    "mediaclk",
    "sendonly",
    "recvonly",
    "sendrecv",
    "inactive",
];

fn bad_number(field: &str) -> SdpError {
    SdpError::BadNumber(field.to_string())
}

/// Parse an SDP session into a validated stream descriptor.
pub fn parse(text: &str) -> Result<StreamDescriptor, BridgeError> {
    let mut version: Option<String> = None;
    let mut origin_address: Option<String> = None;
    let mut session_name = String::new();
    let mut session_info: Option<String> = None;
    let mut connection: Option<(Ipv4Addr, u8)> = None;
    let mut media: Option<(u16, u8)> = None;
    let mut rtpmap: Option<(u8, AudioEncoding, u32, u16)> = None;
    let mut ptime_ms: Option<f64> = None;
    let mut framecount: Option<u32> = None;
    let mut source_filter: Option<Ipv4Addr> = None;
    let mut ptp: Option<(Option<String>, i16)> = None;
    let mut media_clock: Option<String> = None;
    let mut direction: Option<Direction> = None;
    let mut extra: Vec<(String, Option<String>)> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        let mut chars = line.chars();
        let (kind, eq) = (chars.next(), chars.next());
        if eq != Some('=') || !kind.map(|c| c.is_ascii_alphabetic()).unwrap_or(false) {
            continue;
        }
        let value = &line[2..];

        match kind.unwrap_or_default() {
            'v' => version = Some(value.to_string()),
            'o' => {
                let fields: Vec<&str> = value.split_whitespace().collect();
                if fields.len() != 6 {
                    return Err(SdpError::MalformedLine(line.to_string()).into());
                }
                origin_address = Some(fields[5].to_string());
            }
            's' => session_name = value.to_string(),
            'i' => session_info = Some(value.to_string()),
            'c' => connection = Some(parse_connection(line, value)?),
            't' => {} // timing is recognized but carries no descriptor state
            'm' => media = Some(parse_media(line, value)?),
            'a' => {
                let (name, attr_value) = match value.split_once(':') {
                    Some((n, v)) => (n, Some(v)),
                    None => (value, None),
                };

                if !KNOWN_ATTRIBUTES.contains(&name) {
                    extra.push((name.to_string(), attr_value.map(str::to_string)));
                    continue;
                }

                match (name, attr_value) {
                    ("rtpmap", Some(v)) => rtpmap = Some(parse_rtpmap(line, v)?),
                    ("ptime", Some(v)) => {
                        ptime_ms = Some(v.parse::<f64>().map_err(|_| bad_number(line))?);
                    }
                    ("framecount", Some(v)) => {
                        framecount = Some(v.parse::<u32>().map_err(|_| bad_number(line))?);
                    }
                    ("source-filter", Some(v)) => {
                        let caps = SOURCE_FILTER_RE
                            .captures(v)
                            .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;
                        source_filter =
                            Some(caps[2].parse().map_err(|_| bad_number(line))?);
                    }
                    ("ts-refclk", Some(v)) => {
                        if let Some(caps) = TS_REFCLK_RE.captures(v) {
                            let domain: i16 =
                                caps[2].parse().map_err(|_| bad_number(line))?;
                            ptp = Some((caps.get(1).map(|m| m.as_str().to_string()), domain));
                        }
                        // Non-PTP reference clocks are legal SDP; ignore them.
                    }
                    ("mediaclk", Some(v)) => media_clock = Some(v.to_string()),
                    ("sendonly", None) => direction = Some(Direction::SendOnly),
                    ("recvonly", None) => direction = Some(Direction::RecvOnly),
                    ("inactive", None) => direction = Some(Direction::RecvOnly),
                    ("sendrecv", None) => {
                        return Err(SdpError::MalformedLine(line.to_string()).into());
                    }
                    _ => return Err(SdpError::MalformedLine(line.to_string()).into()),
                }
            }
            _ => {} // recognized-but-unused record kinds are ignored
        }
    }

    match version.as_deref() {
        Some("0") => {}
        Some(other) => return Err(SdpError::UnknownVersion(other.to_string()).into()),
        None => return Err(SdpError::MissingField("v").into()),
    }
    let (connection_address, ttl) =
        connection.ok_or(SdpError::MissingField("c"))?;
    let (port, payload_type) = media.ok_or(SdpError::MissingField("m"))?;
    // The media line's payload type wins when the rtpmap disagrees.
    let (_, encoding, sample_rate, num_channels) =
        rtpmap.ok_or(SdpError::MissingField("a=rtpmap"))?;

    // Derive whichever of ptime/framecount is missing from the other.
    let (ptime_ms, framecount) = match (ptime_ms, framecount) {
        (Some(p), Some(f)) => (p, f),
        (Some(p), None) => (p, (sample_rate as f64 * p / 1000.0).round() as u32),
        (None, Some(f)) => (f as f64 * 1000.0 / sample_rate as f64, f),
        (None, None) => (1.0, sample_rate / 1000),
    };

    let (master_clock_id, ptp_domain) = match ptp {
        Some((master, domain)) => (master, domain),
        None => (None, -1),
    };

    let descriptor = StreamDescriptor {
        session_name,
        session_info,
        origin_address: origin_address.unwrap_or_else(|| "0.0.0.0".to_string()),
        connection_address,
        port,
        ttl,
        source_filter,
        encoding,
        sample_rate,
        num_channels,
        payload_type,
        ptime_ms,
        framecount,
        ptp_domain,
        master_clock_id,
        media_clock,
        direction: direction.unwrap_or(Direction::RecvOnly),
        extra_attributes: extra,
    };

    descriptor.validate()?;
    Ok(descriptor)
}

fn parse_connection(line: &str, value: &str) -> Result<(Ipv4Addr, u8), BridgeError> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 3 || fields[0] != "IN" || fields[1] != "IP4" {
        return Err(SdpError::MalformedLine(line.to_string()).into());
    }
    let (addr, ttl) = match fields[2].split_once('/') {
        Some((addr, ttl)) => (
            addr,
            ttl.parse::<u8>().map_err(|_| bad_number(line))?,
        ),
        None => (fields[2], crate::DEFAULT_TTL),
    };
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| SdpError::MalformedLine(line.to_string()))?;
    Ok((addr, ttl))
}

fn parse_media(line: &str, value: &str) -> Result<(u16, u8), BridgeError> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 4 || fields[0] != "audio" || fields[2] != "RTP/AVP" {
        return Err(SdpError::MalformedLine(line.to_string()).into());
    }
    let port: u16 = fields[1].parse().map_err(|_| bad_number(line))?;
    let pt: u8 = fields[3].parse().map_err(|_| bad_number(line))?;
    Ok((port, pt))
}

fn parse_rtpmap(
    line: &str,
    value: &str,
) -> Result<(u8, AudioEncoding, u32, u16), BridgeError> {
    let caps = RTPMAP_RE
        .captures(value)
        .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;
    let pt: u8 = caps[1].parse().map_err(|_| bad_number(line))?;
    let encoding = AudioEncoding::from_rtpmap_name(&caps[2])
        .ok_or_else(|| DescriptorError::InvalidEncoding(caps[2].to_string()))?;
    let rate: u32 = caps[3].parse().map_err(|_| bad_number(line))?;
    let channels: u16 = match caps.get(4) {
        Some(m) => m.as_str().parse().map_err(|_| bad_number(line))?,
        None => 1,
    };
    Ok((pt, encoding, rate, channels))
}

fn format_ptime(ptime_ms: f64) -> String {
    if ptime_ms.fract().abs() < 1e-9 {
        format!("{}", ptime_ms as u64)
    } else {
        format!("{}", ptime_ms)
    }
}

/// Generate the SDP text for a descriptor.
pub fn generate(d: &StreamDescriptor) -> String {
    let mut out = String::with_capacity(512);

    out.push_str("v=0\n");
    out.push_str(&format!("o=- 0 0 IN IP4 {}\n", d.origin_address));
    out.push_str(&format!("s={}\n", d.session_name));
    if let Some(info) = &d.session_info {
        out.push_str(&format!("i={}\n", info));
    }
    out.push_str(&format!(
        "c=IN IP4 {}/{}\n",
        d.connection_address, d.ttl
    ));
    out.push_str("t=0 0\n");
    out.push_str(&format!("m=audio {} RTP/AVP {}\n", d.port, d.payload_type));
    out.push_str(&format!(
        "a=rtpmap:{} {}/{}/{}\n",
        d.payload_type,
        d.encoding.rtpmap_name(),
        d.sample_rate,
        d.num_channels
    ));
    out.push_str(&format!("a=ptime:{}\n", format_ptime(d.ptime_ms)));
    out.push_str(&format!("a=framecount:{}\n", d.framecount));
    out.push_str(&format!("a={}\n", d.direction.sdp_attribute()));
    if let Some(src) = d.source_filter {
        out.push_str(&format!(
            "a=source-filter: incl IN IP4 {} {}\n",
            d.connection_address, src
        ));
    }
    if d.ptp_domain >= 0 {
        match &d.master_clock_id {
            Some(master) => out.push_str(&format!(
                "a=ts-refclk:ptp=IEEE1588-2008:{}:domain-nmbr={}\n",
                master, d.ptp_domain
            )),
            None => out.push_str(&format!(
                "a=ts-refclk:ptp=IEEE1588-2008:domain-nmbr={}\n",
                d.ptp_domain
            )),
        }
    }
    if let Some(clock) = &d.media_clock {
        out.push_str(&format!("a=mediaclk:{}\n", clock));
    }
    for (name, value) in &d.extra_attributes {
        match value {
            Some(v) => out.push_str(&format!("a={}:{}\n", name, v)),
            None => out.push_str(&format!("a={}\n", name)),
        }
    }

    out
}
