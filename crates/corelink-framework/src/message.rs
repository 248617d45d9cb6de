//! The message envelope exchanged between services.
//!
//! Parameters live in seven independent typed maps keyed by [`ParamKey`].
//! Maps are allocated on first insert and omitted from the wire while
//! unset. Looking up an absent key is an error, never a default.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ParamKey, SessionId, TransactionId};
use crate::FrameworkError;

/// A routed, typed message.
///
/// ```rust
/// use corelink_framework::{ids, Message};
///
/// let mut msg = Message::new(ids::CONNECTION_OPENED);
/// msg.set_string(ids::PARAM_KEY_NAME, "Cell_0a1b");
/// msg.set_uint(ids::PARAM_KEY_TYPE, 1);
///
/// let bytes = msg.serialize().unwrap();
/// let parsed = Message::parse(&bytes).unwrap();
/// assert_eq!(parsed.get_string(ids::PARAM_KEY_NAME).unwrap(), "Cell_0a1b");
/// assert!(parsed.get_bool(ids::PARAM_KEY_FLAG).is_err());
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    from: SessionId,
    #[serde(default)]
    to: SessionId,
    #[serde(default)]
    transaction: TransactionId,
    /// Name of the service the message came from. Process-local.
    #[serde(skip)]
    sender: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    bools: Option<BTreeMap<ParamKey, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    strings: Option<BTreeMap<ParamKey, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uints: Option<BTreeMap<ParamKey, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ints: Option<BTreeMap<ParamKey, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    floats: Option<BTreeMap<ParamKey, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uint_arrays: Option<BTreeMap<ParamKey, Vec<u64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_arrays: Option<BTreeMap<ParamKey, Vec<String>>>,
}

impl Message {
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            success: false,
            error: String::new(),
            from: 0,
            to: 0,
            transaction: 0,
            sender: String::new(),
            bools: None,
            strings: None,
            uints: None,
            ints: None,
            floats: None,
            uint_arrays: None,
            string_arrays: None,
        }
    }

    /// Start a reply to `request`: routed back to the requesting session
    /// and carrying its transaction id.
    pub fn reply_to(request: &Message, id: MessageId) -> Self {
        let mut reply = Self::new(id);
        reply.to = request.from;
        reply.transaction = request.transaction;
        reply
    }

    /// Encode in the default wire format (JSON). Non-finite floats are
    /// rejected since they cannot be decoded again.
    pub fn serialize(&self) -> Result<Vec<u8>, FrameworkError> {
        self.ensure_encodable()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn ensure_encodable(&self) -> Result<(), FrameworkError> {
        match self.all_floats().iter().find(|(_, v)| !v.is_finite()) {
            Some((key, value)) => Err(FrameworkError::Serialization(format!(
                "float parameter {key} is {value}"
            ))),
            None => Ok(()),
        }
    }

    /// Decode one message from the default wire format.
    pub fn parse(data: &[u8]) -> Result<Message, FrameworkError> {
        serde_json::from_slice(data).map_err(|e| FrameworkError::Deserialization(e.to_string()))
    }

    // ── Header ──────────────────────────────────────────────────────

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    /// Mark the message failed with a reason.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = error.into();
    }

    pub fn from_session(&self) -> SessionId {
        self.from
    }

    pub fn set_from_session(&mut self, session: SessionId) {
        self.from = session;
    }

    pub fn to_session(&self) -> SessionId {
        self.to
    }

    pub fn set_to_session(&mut self, session: SessionId) {
        self.to = session;
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn set_transaction(&mut self, transaction: TransactionId) {
        self.transaction = transaction;
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.sender = sender.into();
    }
}

macro_rules! param_accessors {
    ($(
        $field:ident: $ty:ty,
        $get:ident -> $ret:ty = |$v:ident| $conv:expr,
        $set:ident($arg:ty),
        $all:ident;
    )*) => {
        impl Message {
            $(
                pub fn $get(&self, key: ParamKey) -> Result<$ret, FrameworkError> {
                    let $v = self
                        .$field
                        .as_ref()
                        .and_then(|m| m.get(&key))
                        .ok_or(FrameworkError::MissingParam { key })?;
                    Ok($conv)
                }

                pub fn $set(&mut self, key: ParamKey, value: $arg) {
                    self.$field
                        .get_or_insert_with(BTreeMap::new)
                        .insert(key, value.into());
                }

                pub fn $all(&self) -> &BTreeMap<ParamKey, $ty> {
                    static EMPTY: BTreeMap<ParamKey, $ty> = BTreeMap::new();
                    self.$field.as_ref().unwrap_or(&EMPTY)
                }
            )*
        }
    };
}

param_accessors! {
    bools: bool,
    get_bool -> bool = |v| *v,
    set_bool(bool),
    all_bools;

    strings: String,
    get_string -> &str = |v| v.as_str(),
    set_string(impl Into<String>),
    all_strings;

    uints: u64,
    get_uint -> u64 = |v| *v,
    set_uint(u64),
    all_uints;

    ints: i64,
    get_int -> i64 = |v| *v,
    set_int(i64),
    all_ints;

    floats: f64,
    get_float -> f64 = |v| *v,
    set_float(f64),
    all_floats;

    uint_arrays: Vec<u64>,
    get_uint_array -> &[u64] = |v| v.as_slice(),
    set_uint_array(Vec<u64>),
    all_uint_arrays;

    string_arrays: Vec<String>,
    get_string_array -> &[String] = |v| v.as_slice(),
    set_string_array(Vec<String>),
    all_string_arrays;
}

/// Deep copy of everything except the process-local sender tag.
impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            success: self.success,
            error: self.error.clone(),
            from: self.from,
            to: self.to,
            transaction: self.transaction,
            sender: String::new(),
            bools: self.bools.clone(),
            strings: self.strings.clone(),
            uints: self.uints.clone(),
            ints: self.ints.clone(),
            floats: self.floats.clone(),
            uint_arrays: self.uint_arrays.clone(),
            string_arrays: self.string_arrays.clone(),
        }
    }
}

/// Equality over wire-visible content; the sender tag is ignored.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.success == other.success
            && self.error == other.error
            && self.from == other.from
            && self.to == other.to
            && self.transaction == other.transaction
            && self.bools == other.bools
            && self.strings == other.strings
            && self.uints == other.uints
            && self.ints == other.ints
            && self.floats == other.floats
            && self.uint_arrays == other.uint_arrays
            && self.string_arrays == other.string_arrays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    const KEY_COUNT: ParamKey = 40;
    const KEY_LABELS: ParamKey = 41;

    fn sample() -> Message {
        let mut msg = Message::new(ids::SERVICE_CONNECTED);
        msg.set_success(true);
        msg.set_from_session(3);
        msg.set_to_session(7);
        msg.set_transaction(99);
        msg.set_sender("Core_01");
        msg.set_string(ids::PARAM_KEY_NAME, "Cell_0a");
        msg.set_uint(ids::PARAM_KEY_TYPE, 1);
        msg.set_bool(ids::PARAM_KEY_FLAG, true);
        msg.set_int(KEY_COUNT, -12);
        msg.set_float(KEY_COUNT, 0.25);
        msg.set_uint_array(KEY_COUNT, vec![1, 2, 3]);
        msg.set_string_array(KEY_LABELS, vec!["a".into(), "b".into()]);
        msg
    }

    #[test]
    fn missing_key_is_an_error() {
        let msg = Message::new(ids::SERVICE_READY);
        assert!(matches!(
            msg.get_string(ids::PARAM_KEY_NAME),
            Err(FrameworkError::MissingParam { key: 0 })
        ));
        assert!(msg.get_uint(ids::PARAM_KEY_TYPE).is_err());
        assert!(msg.all_strings().is_empty());
    }

    #[test]
    fn maps_are_independent() {
        let mut msg = Message::new(ids::SERVICE_READY);
        msg.set_uint(5, 10);
        assert_eq!(msg.get_uint(5).unwrap(), 10);
        assert!(msg.get_int(5).is_err());
        assert!(msg.get_string(5).is_err());
    }

    #[test]
    fn unset_maps_are_absent_on_the_wire() {
        let mut msg = Message::new(ids::SERVICE_READY);
        msg.set_uint(ids::PARAM_KEY_TYPE, 2);
        let json: serde_json::Value = serde_json::from_slice(&msg.serialize().unwrap()).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("uints"));
        assert!(!object.contains_key("strings"));
        assert!(!object.contains_key("bools"));
        assert!(!object.contains_key("sender"));
    }

    #[test]
    fn clone_drops_sender_only() {
        let original = sample();
        let copy = original.clone();
        assert_eq!(copy, original);
        assert_eq!(copy.sender(), "");
        assert_eq!(copy.transaction(), 99);
        assert_eq!(copy.to_session(), 7);
    }

    #[test]
    fn mutating_clone_leaves_original() {
        let original = sample();
        let mut copy = original.clone();
        copy.set_string(ids::PARAM_KEY_NAME, "Image_ff");
        copy.set_uint_array(KEY_COUNT, vec![9]);
        copy.set_int(KEY_LABELS, 1);

        assert_eq!(original.get_string(ids::PARAM_KEY_NAME).unwrap(), "Cell_0a");
        assert_eq!(original.get_uint_array(KEY_COUNT).unwrap(), &[1, 2, 3]);
        assert!(original.get_int(KEY_LABELS).is_err());
        assert_ne!(copy, original);
    }

    #[test]
    fn parse_restores_fields() {
        let original = sample();
        let parsed = Message::parse(&original.serialize().unwrap()).unwrap();
        assert_eq!(parsed, original);
        assert_eq!(parsed.sender(), "");
        assert_eq!(parsed.get_float(KEY_COUNT).unwrap(), 0.25);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Message::parse(b"not json").is_err());
        assert!(Message::parse(b"{\"success\":true}").is_err());
    }

    #[test]
    fn reply_routes_back() {
        let mut request = Message::new(ids::SERVICE_READY);
        request.set_from_session(12);
        request.set_transaction(4);
        let reply = Message::reply_to(&request, ids::SERVICE_AVAILABLE);
        assert_eq!(reply.to_session(), 12);
        assert_eq!(reply.transaction(), 4);
        assert_eq!(reply.from_session(), 0);
    }
}
