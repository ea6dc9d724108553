//! GPX 1.1 emission and ingestion.
//!
//! Emission goes through a small element-stack XML writer: tags are
//! opened and closed explicitly and balance is enforced by the writer.
//! Ingestion of external GPX waypoint files uses a streaming reader.
use std::sync::LazyLock;

use log::warn;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;

use crate::core::{self, Route, Waypoint, MILLIMINUTES_PER_DEGREE};
use crate::error::{EmitError, ParseError};

pub const GPX_NAMESPACE: &str = "http://www.topografix.com/GPX/1/1";
const GPX_CREATOR: &str = "http://code.google.com/p/flytecfs";
const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n";

static TRAILING_ZEROS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.0*\z|0+\z").expect("static regex"));

//==================================================================XML_WRITER

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<Element>,
}

/// Streaming-looking XML builder holding an explicit element stack.
/// `open_tag`/`close_tag` must pair up; `finish` refuses an unbalanced
/// document.
#[derive(Debug, Default)]
pub struct XmlWriter {
    root: Option<Element>,
    stack: Vec<Element>,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_tag(&mut self, name: &str) {
        self.open_tag_with(name, &[]);
    }

    pub fn open_tag_with(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.stack.push(Element {
            name: name.to_string(),
            attrs: attrs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            text: None,
            children: Vec::new(),
        });
    }

    /// Attach character data to the innermost open element.
    pub fn text(&mut self, data: &str) -> Result<(), EmitError> {
        let element = self.stack.last_mut().ok_or(EmitError::Unbalanced)?;
        element.text.get_or_insert_with(String::new).push_str(data);
        Ok(())
    }

    pub fn close_tag(&mut self) -> Result<(), EmitError> {
        let element = self.stack.pop().ok_or(EmitError::Unbalanced)?;
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if self.root.is_none() => self.root = Some(element),
            // A second root element is as unbalanced as a missing one.
            None => return Err(EmitError::Unbalanced),
        }
        Ok(())
    }

    /// Render the document with tab indentation. Fails when tags are
    /// still open or no root was ever closed.
    pub fn finish(self) -> Result<String, EmitError> {
        if !self.stack.is_empty() {
            return Err(EmitError::Unbalanced);
        }
        let root = self.root.ok_or(EmitError::Unbalanced)?;
        let mut out = String::from(XML_DECLARATION);
        render(&root, "", &mut out);
        Ok(out)
    }
}

fn render(element: &Element, prefix: &str, out: &mut String) {
    let mut attrs = String::new();
    for (key, value) in &element.attrs {
        attrs.push_str(&format!(" {}=\"{}\"", key, escape(value)));
    }
    if !element.children.is_empty() {
        out.push_str(&format!("{prefix}<{}{attrs}>\n", element.name));
        for child in &element.children {
            render(child, &format!("{prefix}\t"), out);
        }
        out.push_str(&format!("{prefix}</{}>\n", element.name));
    } else if let Some(text) = &element.text {
        out.push_str(&format!(
            "{prefix}<{0}{attrs}>{1}</{0}>\n",
            element.name,
            escape(text)
        ));
    } else {
        out.push_str(&format!("{prefix}<{}{attrs}/>\n", element.name));
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

//====================================================================EMITTERS

/// Degrees with 8 fractional digits, trailing zeros (and a bare trailing
/// point) stripped.
pub fn format_degrees(milliminutes: i32) -> String {
    let degrees = f64::from(milliminutes) / f64::from(MILLIMINUTES_PER_DEGREE);
    TRAILING_ZEROS_RE
        .replace(&format!("{degrees:.8}"), "")
        .into_owned()
}

fn open_gpx(writer: &mut XmlWriter) {
    writer.open_tag_with(
        "gpx",
        &[
            ("creator", GPX_CREATOR),
            ("version", "1.1"),
            ("xmlns", GPX_NAMESPACE),
            ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
            (
                "xsi:schemaLocation",
                "http://www.topografix.com/GPX/1/1 http://www.topografix.com/GPX/1/1/gpx.xsd",
            ),
        ],
    );
}

fn wpt_tag(writer: &mut XmlWriter, waypoint: &Waypoint, tag: &str) -> Result<(), EmitError> {
    let lat = format_degrees(waypoint.lat);
    let lon = format_degrees(waypoint.lon);
    writer.open_tag_with(tag, &[("lat", &lat), ("lon", &lon)]);
    writer.open_tag("name");
    writer.text(waypoint.long_name.trim_end())?;
    writer.close_tag()?;
    writer.open_tag("ele");
    writer.text(&waypoint.ele.to_string())?;
    writer.close_tag()?;
    writer.close_tag()
}

fn rte_tag(
    writer: &mut XmlWriter,
    route: &Route,
    waypoints: &[Waypoint],
) -> Result<(), EmitError> {
    writer.open_tag("rte");
    writer.open_tag("name");
    writer.text(route.name.trim_end())?;
    writer.close_tag()?;
    for routepoint in &route.routepoints {
        let waypoint = waypoints
            .iter()
            .find(|waypoint| waypoint.long_name == routepoint.long_name)
            .ok_or_else(|| EmitError::UnresolvedWaypoint(routepoint.long_name.clone()))?;
        wpt_tag(writer, waypoint, "rtept")?;
    }
    writer.close_tag()
}

fn document(build: impl FnOnce(&mut XmlWriter) -> Result<(), EmitError>) -> Result<Vec<u8>, EmitError> {
    let mut writer = XmlWriter::new();
    open_gpx(&mut writer);
    build(&mut writer)?;
    writer.close_tag()?;
    Ok(writer.finish()?.into_bytes())
}

/// GPX document for one waypoint.
pub fn waypoint_gpx(waypoint: &Waypoint) -> Result<Vec<u8>, EmitError> {
    document(|writer| wpt_tag(writer, waypoint, "wpt"))
}

/// Aggregate GPX document for every waypoint on the device.
pub fn waypoints_gpx(waypoints: &[Waypoint]) -> Result<Vec<u8>, EmitError> {
    document(|writer| {
        for waypoint in waypoints {
            wpt_tag(writer, waypoint, "wpt")?;
        }
        Ok(())
    })
}

/// GPX document for one route, with routepoints resolved to full
/// waypoints by long name. An unresolved reference is fatal.
pub fn route_gpx(route: &Route, waypoints: &[Waypoint]) -> Result<Vec<u8>, EmitError> {
    document(|writer| rte_tag(writer, route, waypoints))
}

/// Aggregate GPX document for every route on the device.
pub fn routes_gpx(routes: &[Route], waypoints: &[Waypoint]) -> Result<Vec<u8>, EmitError> {
    document(|writer| {
        for route in routes {
            rte_tag(writer, route, waypoints)?;
        }
        Ok(())
    })
}

//===================================================================INGESTION

/// Parse `<wpt lat lon>` waypoints out of a GPX document. `<ele>` and
/// `<name>` are optional; a missing short name is synthesized. Waypoints
/// with out-of-range coordinates are skipped.
pub fn parse_waypoints(data: &[u8]) -> Result<Vec<Waypoint>, ParseError> {
    let mut reader = Reader::from_reader(data);
    reader.trim_text(true);
    let mut waypoints = Vec::new();
    let mut buf = Vec::new();
    // (lat, lon, ele, name) of the wpt element being read.
    let mut wpt: Option<(f64, f64, Option<f64>, Option<String>)> = None;
    let mut field: Option<Vec<u8>> = None;
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|error| ParseError::Gpx(error.to_string()))?
        {
            // A self-closing wpt carries coordinates only.
            Event::Empty(element) if element.local_name().as_ref() == b"wpt" => {
                let (lat, lon) = wpt_coordinates(&element)?;
                push_waypoint(&mut waypoints, (lat, lon, None, None));
            }
            Event::Start(element) if element.local_name().as_ref() == b"wpt" => {
                let (lat, lon) = wpt_coordinates(&element)?;
                wpt = Some((lat, lon, None, None));
            }
            Event::Start(element) if wpt.is_some() => {
                field = Some(element.local_name().as_ref().to_vec());
            }
            Event::Text(text) => {
                if let (Some((_, _, ele, name)), Some(active)) = (&mut wpt, &field) {
                    let value = text
                        .unescape()
                        .map_err(|error| ParseError::Gpx(error.to_string()))?;
                    match active.as_slice() {
                        b"ele" => *ele = value.parse::<f64>().ok(),
                        b"name" => *name = Some(value.into_owned()),
                        _ => {}
                    }
                }
            }
            Event::End(element) => {
                if element.local_name().as_ref() == b"wpt" {
                    if let Some(parts) = wpt.take() {
                        push_waypoint(&mut waypoints, parts);
                    }
                } else {
                    field = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(waypoints)
}

fn wpt_coordinates(element: &quick_xml::events::BytesStart<'_>) -> Result<(f64, f64), ParseError> {
    let mut lat = None;
    let mut lon = None;
    for attr in element.attributes() {
        let attr = attr.map_err(|error| ParseError::Gpx(error.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|error| ParseError::Gpx(error.to_string()))?;
        match attr.key.as_ref() {
            b"lat" => lat = value.parse::<f64>().ok(),
            b"lon" => lon = value.parse::<f64>().ok(),
            _ => {}
        }
    }
    match (lat, lon) {
        (Some(lat), Some(lon)) => Ok((lat, lon)),
        _ => Err(ParseError::Gpx("wpt without lat/lon".to_string())),
    }
}

fn push_waypoint(
    waypoints: &mut Vec<Waypoint>,
    (lat, lon, ele, name): (f64, f64, Option<f64>, Option<String>),
) {
    let lat = (f64::from(MILLIMINUTES_PER_DEGREE) * lat).round() as i32;
    let lon = (f64::from(MILLIMINUTES_PER_DEGREE) * lon).round() as i32;
    if !core::is_valid_lat(lat) || !core::is_valid_lon(lon) {
        warn!("skipping waypoint with out-of-range coordinates");
        return;
    }
    let ele = ele.map(|meters| meters.round() as i32).unwrap_or(0);
    let long_name = name.unwrap_or_default();
    let short_name = core::synthesize_short_name(&long_name, ele);
    waypoints.push(Waypoint {
        lat,
        lon,
        short_name,
        long_name,
        ele,
    });
}
