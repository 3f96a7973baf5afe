//! M-NET XML codec.
//!
//! A document is a tree of named nodes carrying attribute bags:
//!
//! ```xml
//! <Packet>
//!   <Command>getRequest</Command>
//!   <DatabaseManager>
//!     <Mnet Ec="1" Address="5" Group="*" Model="*"/>
//!   </DatabaseManager>
//! </Packet>
//! ```
//!
//! No I/O happens here; see `crate::client` for the transport.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt;
use std::io::Cursor;

use crate::models::mnet::{AirDirection, Device, Drive, Ec, FanSpeed, Mode, Settings, Temperature};

pub const GET_REQUEST: &str = "getRequest";
pub const SET_REQUEST: &str = "setRequest";
pub const GET_RESPONSE: &str = "getResponse";
pub const SET_RESPONSE: &str = "setResponse";

const PACKET: &str = "Packet";
const COMMAND: &str = "Command";
const DATABASE_MANAGER: &str = "DatabaseManager";
const ITEM: &str = "Mnet";
const ERROR: &str = "ERROR";
const WILDCARD: &str = "*";

const ATTR_EC: &str = "Ec";
const ATTR_ADDRESS: &str = "Address";
const ATTR_GROUP: &str = "Group";
const ATTR_MODEL: &str = "Model";
const ATTR_DRIVE: &str = "Drive";
const ATTR_MODE: &str = "Mode";
const ATTR_SET_TEMP: &str = "SetTemp";
const ATTR_FAN_SPEED: &str = "FanSpeed";
const ATTR_AIR_DIRECTION: &str = "AirDirection";
const ATTR_INLET_TEMP: &str = "InletTemp";

// =====================
// Errors
// =====================

/// A device's configuration cannot be addressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    MissingEc { device: String },
    MissingAddress { device: String },
    MissingHost { device: String },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::MissingEc { device } => write!(f, "device {:?}: the EC is missing", device),
            RequestError::MissingAddress { device } => {
                write!(f, "device {:?}: the address of the air conditioner is missing", device)
            }
            RequestError::MissingHost { device } => write!(f, "device {:?}: the host is missing", device),
        }
    }
}

impl std::error::Error for RequestError {}

/// A well-formed document that does not answer the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnexpectedDocument(String),
    UnexpectedCommand(String),
    ErrorResponse {
        point: String,
        code: String,
        message: String,
    },
    MissingAttribute(&'static str),
    InvalidAttribute {
        name: &'static str,
        value: String,
    },
    NoMatchingItem {
        address: u32,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnexpectedDocument(name) => write!(f, "unexpected document root <{}>", name),
            ProtocolError::UnexpectedCommand(cmd) => write!(f, "unexpected command {:?}", cmd),
            ProtocolError::ErrorResponse { point, code, message } => {
                write!(f, "controller error {} at {:?}: {}", code, point, message)
            }
            ProtocolError::MissingAttribute(name) => write!(f, "item is missing attribute {}", name),
            ProtocolError::InvalidAttribute { name, value } => {
                write!(f, "item attribute {} has invalid value {:?}", name, value)
            }
            ProtocolError::NoMatchingItem { address } => write!(f, "no response item for address {}", address),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The payload is not parseable XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlError(pub String);

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xml error: {}", self.0)
    }
}

impl std::error::Error for XmlError {}

fn xml_err(e: impl fmt::Display) -> XmlError {
    XmlError(e.to_string())
}

// =====================
// Document tree
// =====================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Node {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Sets an attribute, keeping the position of an existing one.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn find_descendant(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find_map(|c| if c.name == name { Some(c) } else { c.find_descendant(name) })
    }
}

pub fn to_xml(root: &Node) -> Result<String, XmlError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    write_node(&mut writer, root)?;
    String::from_utf8(writer.into_inner().into_inner()).map_err(xml_err)
}

fn write_node<W: std::io::Write>(writer: &mut Writer<W>, node: &Node) -> Result<(), XmlError> {
    let mut start = BytesStart::new(node.name.as_str());
    for (k, v) in &node.attributes {
        start.push_attribute((k.as_str(), v.as_str()));
    }
    if node.children.is_empty() && node.text.is_none() {
        return writer.write_event(Event::Empty(start)).map_err(xml_err);
    }

    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    if let Some(text) = &node.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_err)?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(xml_err)
}

pub fn from_xml(xml: &str) -> Result<Node, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => stack.push(node_from_start(&e)?),
            Event::Empty(e) => {
                let node = node_from_start(&e)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| XmlError("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(xml_err)?;
                append_text(&mut stack, &text);
            }
            Event::CData(c) => {
                let raw = c.into_inner();
                append_text(&mut stack, &String::from_utf8_lossy(&raw));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(XmlError(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| XmlError("empty document".into()))
}

fn node_from_start(e: &BytesStart<'_>) -> Result<Node, XmlError> {
    let mut node = Node::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) -> Result<(), XmlError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        Ok(())
    } else if root.is_none() {
        *root = Some(node);
        Ok(())
    } else {
        Err(XmlError("multiple root elements".into()))
    }
}

fn append_text(stack: &mut [Node], text: &str) {
    if let Some(top) = stack.last_mut() {
        top.text.get_or_insert_with(String::new).push_str(text);
    }
}

// =====================
// Items
// =====================

/// One `Mnet` element: the addressing of a unit plus whatever state it carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub ec: Option<Ec>,
    pub address: u32,
    /// `None` is sent as the wildcard.
    pub group: Option<u32>,
    /// `None` is sent as the wildcard.
    pub model: Option<String>,
    pub settings: Option<Settings>,
    pub inlet_temperature: Option<Temperature>,
}

impl Item {
    fn to_node(&self) -> Node {
        let mut node = Node::new(ITEM);
        if let Some(ec) = self.ec {
            node.set_attr(ATTR_EC, ec.key());
        }
        node.set_attr(ATTR_ADDRESS, self.address.to_string());
        node.set_attr(
            ATTR_GROUP,
            self.group.map(|g| g.to_string()).unwrap_or_else(|| WILDCARD.to_string()),
        );
        node.set_attr(ATTR_MODEL, self.model.as_deref().unwrap_or(WILDCARD));
        if let Some(s) = &self.settings {
            node.set_attr(ATTR_DRIVE, s.drive.as_str());
            node.set_attr(ATTR_MODE, s.mode.as_str());
            node.set_attr(ATTR_SET_TEMP, s.temperature.to_string());
            node.set_attr(ATTR_FAN_SPEED, s.fan.as_str());
            node.set_attr(ATTR_AIR_DIRECTION, s.air.as_str());
        }
        if let Some(t) = self.inlet_temperature {
            node.set_attr(ATTR_INLET_TEMP, t.to_string());
        }
        node
    }

    fn from_node(node: &Node) -> Result<Item, ProtocolError> {
        let address = node
            .attr(ATTR_ADDRESS)
            .ok_or(ProtocolError::MissingAttribute(ATTR_ADDRESS))
            .and_then(|v| parse_attr::<u32>(ATTR_ADDRESS, v))?;
        let ec = concrete(node, ATTR_EC)
            .map(|v| parse_attr::<u8>(ATTR_EC, v).map(Ec))
            .transpose()?;
        let group = concrete(node, ATTR_GROUP)
            .map(|v| parse_attr::<u32>(ATTR_GROUP, v))
            .transpose()?;
        let model = concrete(node, ATTR_MODEL).map(str::to_string);
        let inlet_temperature = concrete(node, ATTR_INLET_TEMP)
            .map(|v| parse_attr::<Temperature>(ATTR_INLET_TEMP, v))
            .transpose()?;

        Ok(Item {
            ec,
            address,
            group,
            model,
            settings: settings_from_node(node)?,
            inlet_temperature,
        })
    }
}

/// Attribute value unless absent or the wildcard.
fn concrete<'a>(node: &'a Node, name: &str) -> Option<&'a str> {
    node.attr(name).map(str::trim).filter(|v| !v.is_empty() && *v != WILDCARD)
}

fn parse_attr<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ProtocolError> {
    value.trim().parse::<T>().map_err(|_| ProtocolError::InvalidAttribute {
        name,
        value: value.to_string(),
    })
}

/// Full settings when every state attribute is reported, `None` when any is absent.
fn settings_from_node(node: &Node) -> Result<Option<Settings>, ProtocolError> {
    let (Some(drive), Some(mode), Some(temp), Some(fan), Some(air)) = (
        concrete(node, ATTR_DRIVE),
        concrete(node, ATTR_MODE),
        concrete(node, ATTR_SET_TEMP),
        concrete(node, ATTR_FAN_SPEED),
        concrete(node, ATTR_AIR_DIRECTION),
    ) else {
        return Ok(None);
    };
    Ok(Some(Settings {
        drive: parse_attr::<Drive>(ATTR_DRIVE, drive)?,
        mode: parse_attr::<Mode>(ATTR_MODE, mode)?,
        temperature: parse_attr::<Temperature>(ATTR_SET_TEMP, temp)?,
        fan: parse_attr::<FanSpeed>(ATTR_FAN_SPEED, fan)?,
        air: parse_attr::<AirDirection>(ATTR_AIR_DIRECTION, air)?,
    }))
}

/// Addressing item for a device, rejecting configurations the wire cannot express.
pub fn device_item(device: &Device) -> Result<Item, RequestError> {
    let ec = device.ec.ok_or_else(|| RequestError::MissingEc {
        device: device.name.clone(),
    })?;
    let address = device.address().ok_or_else(|| RequestError::MissingAddress {
        device: device.name.clone(),
    })?;
    if device.host().trim().is_empty() {
        return Err(RequestError::MissingHost {
            device: device.name.clone(),
        });
    }
    Ok(Item {
        ec: Some(ec),
        address,
        ..Default::default()
    })
}

// =====================
// Documents
// =====================

pub fn document(command: &str, items: &[Item]) -> Node {
    let mut manager = Node::new(DATABASE_MANAGER);
    manager.children = items.iter().map(Item::to_node).collect();
    Node::new(PACKET)
        .with_child(Node::new(COMMAND).with_text(command))
        .with_child(manager)
}

/// Controller-side error answer for `command` (`getRequest` -> `getErrorResponse`).
pub fn error_document(command: &str, point: &str, code: &str, message: &str) -> Node {
    let reply = format!("{}ErrorResponse", command.trim_end_matches("Request"));
    let mut error = Node::new(ERROR);
    error.set_attr("Point", point);
    error.set_attr("Code", code);
    error.set_attr("Message", message);
    document(&reply, &[]).with_child(error)
}

/// Info request for all `devices`. Every device is validated before anything is built.
/// Group and model are always wildcards so the controller resolves them.
pub fn build_info_request(devices: &[&Device]) -> Result<Node, RequestError> {
    let items = devices
        .iter()
        .map(|d| device_item(d))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(document(GET_REQUEST, &items))
}

/// Settings change for exactly one device, targeted with its resolved group when known.
pub fn build_adjust_request(device: &Device, settings: &Settings) -> Result<Node, RequestError> {
    let mut item = device_item(device)?;
    item.group = device.group();
    item.model = device.model.clone();
    item.settings = Some(settings.clone());
    Ok(document(SET_REQUEST, &[item]))
}

/// Decoding failure of a single `Mnet` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// Set when the element still carried a readable `Address`.
    pub address: Option<u32>,
    pub error: ProtocolError,
}

fn command_of(doc: &Node) -> String {
    doc.child(COMMAND)
        .and_then(|c| c.text.as_deref())
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn item_nodes(doc: &Node) -> impl Iterator<Item = &Node> {
    doc.child(DATABASE_MANAGER)
        .into_iter()
        .flat_map(|manager| manager.children_named(ITEM))
}

/// Command name and items of a document, in either direction.
pub fn decode_document(doc: &Node) -> Result<(String, Vec<Item>), ProtocolError> {
    if doc.name != PACKET {
        return Err(ProtocolError::UnexpectedDocument(doc.name.clone()));
    }
    let items = item_nodes(doc).map(Item::from_node).collect::<Result<Vec<_>, _>>()?;
    Ok((command_of(doc), items))
}

/// Items of a controller response, each decoded on its own.
///
/// Only a document that is unusable as a whole (wrong root or command, an
/// `ERROR` element) is an outer error; a bad item only spoils its own entry.
pub fn decode_response_items(doc: &Node) -> Result<Vec<Result<Item, ItemError>>, ProtocolError> {
    if doc.name != PACKET {
        return Err(ProtocolError::UnexpectedDocument(doc.name.clone()));
    }
    if let Some(error) = doc.find_descendant(ERROR) {
        return Err(ProtocolError::ErrorResponse {
            point: error.attr("Point").unwrap_or_default().to_string(),
            code: error.attr("Code").unwrap_or_default().to_string(),
            message: error.attr("Message").unwrap_or_default().to_string(),
        });
    }
    let command = command_of(doc);
    if !command.ends_with("Response") || command.ends_with("ErrorResponse") {
        return Err(ProtocolError::UnexpectedCommand(command));
    }
    Ok(item_nodes(doc)
        .map(|node| {
            Item::from_node(node).map_err(|error| ItemError {
                address: concrete(node, ATTR_ADDRESS).and_then(|v| v.parse().ok()),
                error,
            })
        })
        .collect())
}

/// Items of a controller response; the first bad item fails the whole response.
pub fn decode_response(doc: &Node) -> Result<Vec<Item>, ProtocolError> {
    decode_response_items(doc)?
        .into_iter()
        .map(|item| item.map_err(|e| e.error))
        .collect()
}

pub fn find_item(items: &[Item], address: u32) -> Option<&Item> {
    items.iter().find(|item| item.address == address)
}

/// The decoded item or the item's own error for `address`, if the response mentions it.
pub fn find_item_result(items: &[Result<Item, ItemError>], address: u32) -> Option<Result<&Item, &ProtocolError>> {
    items.iter().find_map(|entry| match entry {
        Ok(item) if item.address == address => Some(Ok(item)),
        Err(e) if e.address == Some(address) => Some(Err(&e.error)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cool_22, device};

    #[test]
    fn info_request_uses_wildcards() {
        let mut d = device("d1", 5);
        d.model = Some("PKFY".into());
        let doc = build_info_request(&[&d]).expect("valid device");
        let xml = to_xml(&doc).expect("encode");
        assert!(xml.contains("<Command>getRequest</Command>"), "{xml}");
        assert!(
            xml.contains(r#"<Mnet Ec="1" Address="5" Group="*" Model="*"/>"#),
            "{xml}"
        );
    }

    #[test]
    fn info_request_rejects_any_invalid_device() {
        let good = device("d1", 5);
        let mut bad = device("d2", 6);
        bad.set_address(None);
        let err = build_info_request(&[&good, &bad]).unwrap_err();
        assert_eq!(err, RequestError::MissingAddress { device: "d2".into() });

        bad.set_address(Some(6));
        bad.ec = None;
        let err = build_info_request(&[&good, &bad]).unwrap_err();
        assert_eq!(err, RequestError::MissingEc { device: "d2".into() });
    }

    #[test]
    fn adjust_request_targets_resolved_group() {
        let mut d = device("d1", 5);
        let doc = build_adjust_request(&d, &cool_22()).expect("valid device");
        let (command, items) = decode_document(&doc).expect("decode");
        assert_eq!(command, SET_REQUEST);
        assert_eq!(items[0].group, None);

        d.resolve_group(7);
        let doc = build_adjust_request(&d, &cool_22()).expect("valid device");
        let xml = to_xml(&doc).expect("encode");
        assert!(xml.contains(r#"Group="7""#), "{xml}");
        assert!(xml.contains(r#"Drive="ON" Mode="COOL" SetTemp="22.0" FanSpeed="AUTO" AirDirection="SWING""#), "{xml}");
    }

    #[test]
    fn poll_response_decodes_to_observed_state() {
        let d = device("d1", 5);
        let request = to_xml(&build_info_request(&[&d]).expect("valid")).expect("encode");
        let parsed = from_xml(&request).expect("parse request");
        let (_, requested) = decode_document(&parsed).expect("decode request");

        let reply = Item {
            group: Some(2),
            model: Some("PLFY".into()),
            settings: Some(cool_22()),
            ..requested[0].clone()
        };
        let xml = to_xml(&document(GET_RESPONSE, &[reply])).expect("encode");
        let items = decode_response(&from_xml(&xml).expect("parse")).expect("decode");
        let item = find_item(&items, 5).expect("item for address");
        assert_eq!(item.settings.as_ref(), Some(&cool_22()));
        assert_eq!(item.group, Some(2));
        assert_eq!(item.model.as_deref(), Some("PLFY"));
        assert!(find_item(&items, 6).is_none());
    }

    #[test]
    fn error_response_is_a_protocol_error() {
        let xml = to_xml(&error_document(GET_REQUEST, "Address", "0101", "Invalid Value")).expect("encode");
        assert!(xml.contains("getErrorResponse"), "{xml}");
        let err = decode_response(&from_xml(&xml).expect("parse")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ErrorResponse {
                point: "Address".into(),
                code: "0101".into(),
                message: "Invalid Value".into(),
            }
        );
    }

    #[test]
    fn invalid_state_attribute_is_reported() {
        let xml = r#"<Packet><Command>getResponse</Command><DatabaseManager>
            <Mnet Ec="1" Address="5" Group="1" Model="X" Drive="ON" Mode="TURBO" SetTemp="22.0" FanSpeed="LOW" AirDirection="AUTO"/>
            </DatabaseManager></Packet>"#;
        let err = decode_response(&from_xml(xml).expect("parse")).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidAttribute {
                name: "Mode",
                value: "TURBO".into()
            }
        );
    }

    #[test]
    fn partial_state_yields_no_settings() {
        let xml = r#"<Packet><Command>setResponse</Command><DatabaseManager>
            <Mnet Ec="1" Address="5" Group="1" Drive="ON"/></DatabaseManager></Packet>"#;
        let items = decode_response(&from_xml(xml).expect("parse")).expect("decode");
        assert_eq!(items[0].settings, None);
        assert_eq!(items[0].model, None);
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(from_xml("<Packet><Command>getResponse</Packet>").is_err());
        assert!(from_xml("").is_err());
        assert!(from_xml("<A/><B/>").is_err());
    }

    #[test]
    fn text_and_attributes_are_escaped() {
        let mut node = Node::new("Packet").with_child(Node::new("Command").with_text("a<b"));
        node.set_attr("Note", "x\"&y");
        let xml = to_xml(&node).expect("encode");
        assert_eq!(from_xml(&xml).expect("parse"), node);
    }

    #[test]
    fn bad_item_spoils_only_its_own_entry() {
        let xml = r#"<Packet><Command>getResponse</Command><DatabaseManager>
            <Mnet Ec="1" Address="5" Group="1" Model="X" Drive="ON" Mode="COOL" SetTemp="22.0" FanSpeed="AUTO" AirDirection="SWING"/>
            <Mnet Ec="1" Address="6" Group="1" Model="X" Drive="ON" Mode="TURBO" SetTemp="22.0" FanSpeed="AUTO" AirDirection="SWING"/>
            <Mnet Ec="1" Address="seven" Group="1"/>
            </DatabaseManager></Packet>"#;
        let doc = from_xml(xml).expect("parse");
        let items = decode_response_items(&doc).expect("usable response");
        assert_eq!(items.len(), 3);

        let good = find_item_result(&items, 5).expect("address 5").expect("valid item");
        assert_eq!(good.settings.as_ref(), Some(&cool_22()));
        let bad = find_item_result(&items, 6).expect("address 6").unwrap_err();
        assert_eq!(
            bad,
            &ProtocolError::InvalidAttribute {
                name: "Mode",
                value: "TURBO".into()
            }
        );
        assert!(find_item_result(&items, 7).is_none());
        assert!(decode_response(&doc).is_err());
    }
}
