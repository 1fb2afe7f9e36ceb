//! Locally executable functions, addressable by id or name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};

/// Function identifier carried on the wire.
pub type FunctionId = i32;

/// Sentinel id of the invalid function.
pub const INVALID_FUNCTION: FunctionId = -1;
/// Built-in: returns the node's name as raw bytes.
pub const REQUEST_NODE_NAME: FunctionId = -2;
/// Built-in: takes a function name, returns a [`FunctionStatus`].
pub const REQUEST_FUNCTION_STATUS: FunctionId = -3;
/// Built-in: returns the catalog of registered functions.
pub const REQUEST_AVAILABLE_FUNCTIONS: FunctionId = -4;

/// Longest function name a catalog entry can carry, in bytes.
pub const MAX_FUNCTION_NAME: usize = u16::MAX as usize;

const NODE_NAME_FUNCTION: &str = "REQUEST_NODENAME";
const FUNCTION_STATUS_FUNCTION: &str = "REQUEST_FUNCTION_STATUS";
const AVAILABLE_FUNCTIONS_FUNCTION: &str = "REQUEST_AVAILABLE_FUNCTIONS";

/// Handler signature for user functions. `None` reports failure.
pub type FunctionImplementation = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Identity of a callable function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionInfo {
    pub valid: bool,
    pub name: String,
    pub id: FunctionId,
}

impl FunctionInfo {
    pub fn new(name: impl Into<String>, id: FunctionId) -> Self {
        Self {
            valid: true,
            name: name.into(),
            id,
        }
    }

    /// The sentinel returned for lookups that miss.
    pub fn invalid() -> Self {
        Self {
            valid: false,
            name: String::new(),
            id: INVALID_FUNCTION,
        }
    }

    pub fn node_name() -> Self {
        Self::new(NODE_NAME_FUNCTION, REQUEST_NODE_NAME)
    }

    pub fn function_status() -> Self {
        Self::new(FUNCTION_STATUS_FUNCTION, REQUEST_FUNCTION_STATUS)
    }

    pub fn available_functions() -> Self {
        Self::new(AVAILABLE_FUNCTIONS_FUNCTION, REQUEST_AVAILABLE_FUNCTIONS)
    }
}

/// Availability of a function, as reported by `REQUEST_FUNCTION_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FunctionStatus {
    Valid = 0,
    Invalid = 1,
    NotExist = 2,
}

impl FunctionStatus {
    /// Wire form: `i32` little-endian.
    pub fn to_bytes(self) -> [u8; 4] {
        (self as i32).to_le_bytes()
    }

    /// Parse the wire form. Extra trailing bytes are rejected.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = raw.try_into().ok()?;
        match i32::from_le_bytes(raw) {
            0 => Some(FunctionStatus::Valid),
            1 => Some(FunctionStatus::Invalid),
            2 => Some(FunctionStatus::NotExist),
            _ => None,
        }
    }
}

impl fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FunctionStatus::Valid => "valid",
            FunctionStatus::Invalid => "invalid",
            FunctionStatus::NotExist => "not-exist",
        })
    }
}

/// Encode a function catalog: repeated `[id: i32 LE][name len: u16 LE][name]`.
///
/// Names longer than [`MAX_FUNCTION_NAME`] are cut at the last character
/// boundary that fits.
pub fn encode_catalog(functions: &[FunctionInfo]) -> Bytes {
    let mut buf = BytesMut::new();
    for function in functions {
        let name = function.name.as_str();
        let mut len = name.len().min(MAX_FUNCTION_NAME);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        buf.put_i32_le(function.id);
        buf.put_u16_le(len as u16);
        buf.put_slice(&name.as_bytes()[..len]);
    }
    buf.freeze()
}

/// Decode a catalog produced by [`encode_catalog`].
pub fn decode_catalog(mut raw: &[u8]) -> Result<Vec<FunctionInfo>> {
    let mut functions = Vec::new();
    while raw.has_remaining() {
        if raw.remaining() < 6 {
            return Err(NodeError::MalformedReply(format!(
                "truncated catalog entry ({} bytes left)",
                raw.remaining()
            )));
        }
        let id = raw.get_i32_le();
        let len = raw.get_u16_le() as usize;
        if raw.remaining() < len {
            return Err(NodeError::MalformedReply(format!(
                "catalog name for id {id} needs {len} bytes, {} left",
                raw.remaining()
            )));
        }
        let name = std::str::from_utf8(&raw[..len])
            .map_err(|err| NodeError::MalformedReply(format!("catalog name for id {id} is not UTF-8: {err}")))?
            .to_string();
        raw.advance(len);
        functions.push(FunctionInfo::new(name, id));
    }
    Ok(functions)
}

#[derive(Clone)]
enum Implementation {
    NodeName,
    FunctionStatus,
    AvailableFunctions,
    Handler(FunctionImplementation),
}

struct Entry {
    info: FunctionInfo,
    implementation: Implementation,
}

#[derive(Default)]
struct Tables {
    by_id: BTreeMap<FunctionId, Entry>,
    by_name: HashMap<String, FunctionId>,
}

impl Tables {
    fn status(&self, name: &str) -> FunctionStatus {
        match self.by_name.get(name).and_then(|id| self.by_id.get(id)) {
            Some(entry) if entry.info.valid => FunctionStatus::Valid,
            Some(_) => FunctionStatus::Invalid,
            None => FunctionStatus::NotExist,
        }
    }

    fn insert(&mut self, info: FunctionInfo, implementation: Implementation) {
        self.by_name.insert(info.name.clone(), info.id);
        self.by_id.insert(
            info.id,
            Entry {
                info,
                implementation,
            },
        );
    }
}

enum Invocation {
    Ready(Bytes),
    Call(FunctionImplementation),
}

/// Functions this node can execute on behalf of peers.
///
/// Names and ids are both unique. Negative ids are reserved for the
/// built-ins installed by [`FunctionRegistry::new`].
pub struct FunctionRegistry {
    node_name: String,
    tables: RwLock<Tables>,
}

impl FunctionRegistry {
    /// Create a registry with the built-in functions installed.
    pub fn new(node_name: impl Into<String>) -> Self {
        let mut tables = Tables::default();
        tables.insert(FunctionInfo::node_name(), Implementation::NodeName);
        tables.insert(FunctionInfo::function_status(), Implementation::FunctionStatus);
        tables.insert(
            FunctionInfo::available_functions(),
            Implementation::AvailableFunctions,
        );

        Self {
            node_name: node_name.into(),
            tables: RwLock::new(tables),
        }
    }

    /// Name served by `REQUEST_NODENAME`.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Register a user function under a name and a non-negative id.
    pub fn register<F>(&self, name: &str, id: FunctionId, handler: F) -> Result<FunctionInfo>
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        if id < 0 {
            return Err(NodeError::ReservedFunctionId(id));
        }
        if name.len() > MAX_FUNCTION_NAME {
            return Err(NodeError::FunctionNameTooLong {
                len: name.len(),
                max: MAX_FUNCTION_NAME,
            });
        }

        let mut tables = self.write();
        if tables.by_name.contains_key(name) || tables.by_id.contains_key(&id) {
            warn!(name, id, "function registration conflicts with existing entry");
            return Err(NodeError::DuplicateFunction {
                name: name.to_string(),
                id,
            });
        }

        let info = FunctionInfo::new(name, id);
        tables.insert(info.clone(), Implementation::Handler(Arc::new(handler)));
        info!(name, id, "function registered");
        Ok(info)
    }

    /// Mark a function invalid. Its name and id stay taken.
    ///
    /// Returns `false` when no function has this id.
    pub fn disable(&self, id: FunctionId) -> bool {
        let mut tables = self.write();
        match tables.by_id.get_mut(&id) {
            Some(entry) => {
                entry.info.valid = false;
                debug!(name = %entry.info.name, id, "function disabled");
                true
            }
            None => false,
        }
    }

    /// Look up by id; the invalid sentinel when absent.
    pub fn info(&self, id: FunctionId) -> FunctionInfo {
        self.read()
            .by_id
            .get(&id)
            .map(|entry| entry.info.clone())
            .unwrap_or_else(FunctionInfo::invalid)
    }

    /// Look up by name; the invalid sentinel when absent.
    pub fn info_by_name(&self, name: &str) -> FunctionInfo {
        let tables = self.read();
        tables
            .by_name
            .get(name)
            .and_then(|id| tables.by_id.get(id))
            .map(|entry| entry.info.clone())
            .unwrap_or_else(FunctionInfo::invalid)
    }

    pub fn contains(&self, id: FunctionId) -> bool {
        self.read().by_id.contains_key(&id)
    }

    pub fn status(&self, name: &str) -> FunctionStatus {
        self.read().status(name)
    }

    /// Every registered function, ordered by id.
    pub fn list(&self) -> Vec<FunctionInfo> {
        self.read()
            .by_id
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Run a function. `None` when it is absent, disabled, or fails.
    ///
    /// User handlers run without the registry lock held, so a handler may
    /// register or query functions itself.
    pub fn invoke(&self, id: FunctionId, input: &[u8]) -> Option<Bytes> {
        let invocation = self.prepare(id, input)?;
        match invocation {
            Invocation::Ready(output) => Some(output),
            Invocation::Call(handler) => handler(input).map(Bytes::from),
        }
    }

    fn prepare(&self, id: FunctionId, input: &[u8]) -> Option<Invocation> {
        let tables = self.read();
        let Some(entry) = tables.by_id.get(&id) else {
            debug!(id, "invoke of unknown function");
            return None;
        };
        if !entry.info.valid {
            debug!(id, name = %entry.info.name, "invoke of disabled function");
            return None;
        }

        let invocation = match &entry.implementation {
            Implementation::NodeName => {
                Invocation::Ready(Bytes::copy_from_slice(self.node_name.as_bytes()))
            }
            Implementation::FunctionStatus => {
                let name = String::from_utf8_lossy(input);
                let status = tables.status(&name);
                Invocation::Ready(Bytes::copy_from_slice(&status.to_bytes()))
            }
            Implementation::AvailableFunctions => {
                let functions: Vec<FunctionInfo> = tables
                    .by_id
                    .values()
                    .filter(|entry| entry.info.valid)
                    .map(|entry| entry.info.clone())
                    .collect();
                Invocation::Ready(encode_catalog(&functions))
            }
            Implementation::Handler(handler) => Invocation::Call(Arc::clone(handler)),
        };
        Some(invocation)
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("node_name", &self.node_name)
            .field("functions", &self.read().by_id.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(input: &[u8]) -> Option<Vec<u8>> {
        Some(input.to_vec())
    }

    #[test]
    fn builtins_are_installed() {
        let registry = FunctionRegistry::new("alpha");
        assert!(registry.info(REQUEST_NODE_NAME).valid);
        assert!(registry.info(REQUEST_FUNCTION_STATUS).valid);
        assert!(registry.info(REQUEST_AVAILABLE_FUNCTIONS).valid);
        assert_eq!(registry.info_by_name("REQUEST_NODENAME").id, REQUEST_NODE_NAME);
        assert_eq!(
            registry.invoke(REQUEST_NODE_NAME, &[]).unwrap().as_ref(),
            b"alpha"
        );
    }

    #[test]
    fn register_and_invoke() {
        let registry = FunctionRegistry::new("n");
        let info = registry.register("echo", 7, echo).unwrap();
        assert_eq!(info, FunctionInfo::new("echo", 7));
        assert_eq!(registry.invoke(7, b"hi").unwrap().as_ref(), b"hi");
        assert_eq!(registry.info_by_name("echo"), info);
    }

    #[test]
    fn duplicate_name_or_id_is_rejected_without_mutation() {
        let registry = FunctionRegistry::new("n");
        registry.register("echo", 1, echo).unwrap();

        let by_name = registry.register("echo", 2, echo).unwrap_err();
        assert!(matches!(by_name, NodeError::DuplicateFunction { id: 2, .. }));
        let by_id = registry.register("other", 1, echo).unwrap_err();
        assert!(matches!(by_id, NodeError::DuplicateFunction { id: 1, .. }));

        assert!(!registry.contains(2));
        assert!(!registry.info_by_name("other").valid);
        assert_eq!(registry.list().len(), 4);
    }

    #[test]
    fn negative_ids_are_reserved() {
        let registry = FunctionRegistry::new("n");
        assert!(matches!(
            registry.register("mine", -9, echo),
            Err(NodeError::ReservedFunctionId(-9))
        ));
    }

    #[test]
    fn missing_lookups_return_sentinel() {
        let registry = FunctionRegistry::new("n");
        assert_eq!(registry.info(42), FunctionInfo::invalid());
        assert_eq!(registry.info_by_name("nope"), FunctionInfo::invalid());
        assert!(registry.invoke(42, b"").is_none());
    }

    #[test]
    fn status_builtin_reports_all_three_states() {
        let registry = FunctionRegistry::new("n");
        registry.register("live", 1, echo).unwrap();
        registry.register("dead", 2, echo).unwrap();
        assert!(registry.disable(2));

        let status = |name: &str| {
            FunctionStatus::from_bytes(&registry.invoke(REQUEST_FUNCTION_STATUS, name.as_bytes()).unwrap())
        };
        assert_eq!(status("live"), Some(FunctionStatus::Valid));
        assert_eq!(status("dead"), Some(FunctionStatus::Invalid));
        assert_eq!(status("ghost"), Some(FunctionStatus::NotExist));
    }

    #[test]
    fn disabled_function_is_not_invoked() {
        let registry = FunctionRegistry::new("n");
        registry.register("echo", 3, echo).unwrap();
        registry.disable(3);
        assert!(registry.invoke(3, b"x").is_none());
        assert!(!registry.info(3).valid);
        assert!(!registry.disable(99));
    }

    #[test]
    fn failing_handler_yields_none() {
        let registry = FunctionRegistry::new("n");
        registry.register("fail", 4, |_: &[u8]| None).unwrap();
        assert!(registry.invoke(4, b"x").is_none());
    }

    #[test]
    fn catalog_lists_valid_functions() {
        let registry = FunctionRegistry::new("n");
        registry.register("echo", 1, echo).unwrap();
        registry.register("off", 2, echo).unwrap();
        registry.disable(2);

        let raw = registry.invoke(REQUEST_AVAILABLE_FUNCTIONS, &[]).unwrap();
        let catalog = decode_catalog(&raw).unwrap();
        let names: Vec<&str> = catalog.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "REQUEST_AVAILABLE_FUNCTIONS",
                "REQUEST_FUNCTION_STATUS",
                "REQUEST_NODENAME",
                "echo"
            ]
        );
    }

    #[test]
    fn truncated_catalog_is_malformed() {
        let mut raw = encode_catalog(&[FunctionInfo::new("echo", 1)]).to_vec();
        raw.pop();
        assert!(matches!(
            decode_catalog(&raw),
            Err(NodeError::MalformedReply(_))
        ));
    }

    #[test]
    fn oversized_name_is_rejected_at_registration() {
        let registry = FunctionRegistry::new("n");
        let err = registry.register(&"x".repeat(70_000), 1, echo).unwrap_err();
        assert!(matches!(
            err,
            NodeError::FunctionNameTooLong { len: 70_000, max: MAX_FUNCTION_NAME }
        ));
        assert!(!registry.contains(1));
    }

    #[test]
    fn catalog_cuts_long_names_on_char_boundary() {
        // Two-byte characters; the odd byte limit falls inside one.
        let long = FunctionInfo::new("é".repeat(40_000), 9);
        let catalog = decode_catalog(&encode_catalog(&[long])).unwrap();
        assert_eq!(catalog[0].name, "é".repeat(MAX_FUNCTION_NAME / 2));
        assert_eq!(catalog[0].id, 9);
    }

    #[test]
    fn non_utf8_catalog_name_is_malformed() {
        let raw = [1, 0, 0, 0, 2, 0, 0xC3, 0x28];
        assert!(matches!(
            decode_catalog(&raw),
            Err(NodeError::MalformedReply(_))
        ));
    }

    #[test]
    fn handler_may_reenter_registry() {
        let registry = Arc::new(FunctionRegistry::new("n"));
        let inner = Arc::clone(&registry);
        registry
            .register("count", 5, move |_: &[u8]| {
                Some(vec![inner.list().len() as u8])
            })
            .unwrap();
        assert_eq!(registry.invoke(5, &[]).unwrap().as_ref(), &[4]);
    }

    #[test]
    fn status_wire_form() {
        assert_eq!(FunctionStatus::NotExist.to_bytes(), [2, 0, 0, 0]);
        assert_eq!(FunctionStatus::from_bytes(&[1, 0, 0, 0]), Some(FunctionStatus::Invalid));
        assert_eq!(FunctionStatus::from_bytes(&[9, 0, 0, 0]), None);
        assert_eq!(FunctionStatus::from_bytes(&[0, 0]), None);
    }
}
