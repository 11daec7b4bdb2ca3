//! Request and reply model of the kernel boundary
//!
//! The kernel hands over `RawRequest`s in batches and takes `RawReply`s back.
//! Each carries an identifier, a byte length, a target cookie, a class/opcode
//! pair and an opaque payload that the engine never interprets. Component
//! names travel next to the payload for operations whose target path the
//! engine may track.

use core::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::error::{UmError, UmResult};
use crate::id::{Cookie, RequestId};

/// Fixed header size accounted in `len` of requests and replies
pub const HEADER_LEN: usize = 40;

/// Request flag: no reply is expected
pub const REQ_FAF: u32 = 1 << 0;

/// Operation classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpClass {
    /// Filesystem-level operations (unmount, statvfs, sync)
    Vfs = 1,
    /// Per-node operations (lookup, read, write)
    Vn = 2,
    /// Cache hints; never answered
    Cache = 3,
    /// Administrative notices from the kernel; never answered
    Admin = 4,
}

impl OpClass {
    pub fn from_u8(v: u8) -> Option<OpClass> {
        match v {
            1 => Some(OpClass::Vfs),
            2 => Some(OpClass::Vn),
            3 => Some(OpClass::Cache),
            4 => Some(OpClass::Admin),
            _ => None,
        }
    }
}

macro_rules! opcodes {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $val:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $val),+
        }

        impl $name {
            /// Every opcode of this class
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn from_u32(v: u32) -> Option<$name> {
                match v {
                    $($val => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes!(
    /// Filesystem-level opcodes
    VfsOp {
        Unmount = 0,
        Statvfs = 1,
        Sync = 2,
        FhToNode = 3,
        NodeToFh = 4,
        Suspend = 5,
        ExtattrCtl = 6,
    }
);

opcodes!(
    /// Per-node opcodes
    VnOp {
        Lookup = 0,
        Create = 1,
        Mknod = 2,
        Open = 3,
        Close = 4,
        Access = 5,
        Getattr = 6,
        Setattr = 7,
        Poll = 8,
        Fsync = 9,
        Seek = 10,
        Remove = 11,
        Link = 12,
        Rename = 13,
        Mkdir = 14,
        Rmdir = 15,
        Symlink = 16,
        Readdir = 17,
        Readlink = 18,
        Reclaim = 19,
        Inactive = 20,
        Print = 21,
        Pathconf = 22,
        Advlock = 23,
        Read = 24,
        Write = 25,
        Abortop = 26,
        Getextattr = 27,
        Setextattr = 28,
        Listextattr = 29,
        Deleteextattr = 30,
    }
);

opcodes!(
    /// Cache hint opcodes
    CacheOp {
        Write = 0,
    }
);

opcodes!(
    /// Administrative opcodes
    AdminOp {
        /// The kernel rejected an earlier reply
        Error = 0,
    }
);

/// A decoded class/opcode pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Vfs(VfsOp),
    Vn(VnOp),
    Cache(CacheOp),
    Admin(AdminOp),
}

impl Operation {
    /// Decode a raw class/opcode pair
    pub fn decode(class: u8, opcode: u32) -> UmResult<Operation> {
        let unknown = UmError::UnknownRequest { class, opcode };
        let op = match OpClass::from_u8(class).ok_or(unknown.clone())? {
            OpClass::Vfs => VfsOp::from_u32(opcode).map(Operation::Vfs),
            OpClass::Vn => VnOp::from_u32(opcode).map(Operation::Vn),
            OpClass::Cache => CacheOp::from_u32(opcode).map(Operation::Cache),
            OpClass::Admin => AdminOp::from_u32(opcode).map(Operation::Admin),
        };
        op.ok_or(unknown)
    }

    pub fn class(&self) -> OpClass {
        match self {
            Operation::Vfs(_) => OpClass::Vfs,
            Operation::Vn(_) => OpClass::Vn,
            Operation::Cache(_) => OpClass::Cache,
            Operation::Admin(_) => OpClass::Admin,
        }
    }

    pub fn opcode(&self) -> u32 {
        match *self {
            Operation::Vfs(op) => op as u32,
            Operation::Vn(op) => op as u32,
            Operation::Cache(op) => op as u32,
            Operation::Admin(op) => op as u32,
        }
    }

    /// Operations whose target path is built before the handler runs
    pub fn builds_path(&self) -> bool {
        matches!(
            self,
            Operation::Vn(
                VnOp::Lookup
                    | VnOp::Create
                    | VnOp::Mknod
                    | VnOp::Mkdir
                    | VnOp::Symlink
                    | VnOp::Rename
                    | VnOp::Link
            )
        )
    }

    /// Operations that yield a new node on success
    pub fn creates_node(&self) -> bool {
        matches!(
            self,
            Operation::Vn(
                VnOp::Lookup | VnOp::Create | VnOp::Mknod | VnOp::Mkdir | VnOp::Symlink
            )
        )
    }

    /// Classes that are never answered regardless of request flags
    pub fn never_replied(&self) -> bool {
        matches!(self, Operation::Cache(_) | Operation::Admin(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Vfs(op) => write!(f, "vfs.{:?}", op),
            Operation::Vn(op) => write!(f, "vn.{:?}", op),
            Operation::Cache(op) => write!(f, "cache.{:?}", op),
            Operation::Admin(op) => write!(f, "admin.{:?}", op),
        }
    }
}

/// Names carried by path-tracked operations
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentNames {
    /// Name of the target inside the directory named by the request cookie
    pub name: Vec<u8>,
    /// Destination directory (rename)
    pub target_dir: Option<Cookie>,
    /// Destination name (rename, link)
    pub target_name: Option<Vec<u8>>,
}

impl ComponentNames {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Names for a rename of `name` to `target_name` inside `target_dir`
    pub fn rename(name: impl Into<Vec<u8>>, target_dir: Cookie, target_name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            target_dir: Some(target_dir),
            target_name: Some(target_name.into()),
        }
    }

    fn wire_len(&self) -> usize {
        self.name.len() + self.target_name.as_ref().map_or(0, Vec::len)
    }
}

/// Request as received from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub id: RequestId,
    /// Header + names + payload
    pub len: u32,
    pub cookie: Cookie,
    pub class: u8,
    pub opcode: u32,
    pub flags: u32,
    pub names: Option<ComponentNames>,
    pub payload: Vec<u8>,
}

impl RawRequest {
    /// Build a request with a consistent `len`
    pub fn new(id: u64, cookie: Cookie, op: Operation, payload: Vec<u8>) -> Self {
        let mut req = Self {
            id: RequestId(id),
            len: 0,
            cookie,
            class: op.class() as u8,
            opcode: op.opcode(),
            flags: 0,
            names: None,
            payload,
        };
        req.len = req.expected_len() as u32;
        req
    }

    /// Attach component names, keeping `len` consistent
    pub fn with_names(mut self, names: ComponentNames) -> Self {
        self.names = Some(names);
        self.len = self.expected_len() as u32;
        self
    }

    /// Mark the request as not expecting a reply
    pub fn fire_and_forget(mut self) -> Self {
        self.flags |= REQ_FAF;
        self
    }

    fn expected_len(&self) -> usize {
        HEADER_LEN + self.names.as_ref().map_or(0, ComponentNames::wire_len) + self.payload.len()
    }
}

/// Decoded request handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub cookie: Cookie,
    pub op: Operation,
    pub fire_and_forget: bool,
    pub names: Option<ComponentNames>,
    pub payload: Vec<u8>,
}

impl Request {
    /// Build the reply skeleton for this request
    pub fn reply(&self) -> RawReply {
        RawReply {
            id: self.id,
            len: HEADER_LEN as u32,
            cookie: self.cookie,
            class: self.op.class() as u8,
            opcode: self.op.opcode(),
            error: 0,
            setback: SetbackFlags::NONE,
            payload: Vec::new(),
        }
    }

    /// Whether no reply may be produced for this request
    pub fn expects_no_reply(&self) -> bool {
        self.fire_and_forget || self.op.never_replied()
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = UmError;

    fn try_from(raw: RawRequest) -> UmResult<Request> {
        let op = Operation::decode(raw.class, raw.opcode)?;
        if raw.len as usize != raw.expected_len() {
            return Err(UmError::MalformedBatch("request length mismatch"));
        }
        if op.builds_path() && raw.names.is_none() {
            return Err(UmError::MalformedBatch("missing component name"));
        }
        Ok(Request {
            id: raw.id,
            cookie: raw.cookie,
            op,
            fire_and_forget: raw.flags & REQ_FAF != 0,
            names: raw.names,
            payload: raw.payload,
        })
    }
}

/// Kernel-side actions requested alongside a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct SetbackFlags(pub u32);

impl SetbackFlags {
    pub const NONE: SetbackFlags = SetbackFlags(0);
    /// Drop the kernel reference of the first node of the operation
    pub const NOREF_N1: SetbackFlags = SetbackFlags(1 << 0);
    /// Drop the kernel reference of the second node of the operation
    pub const NOREF_N2: SetbackFlags = SetbackFlags(1 << 1);

    #[inline]
    pub const fn contains(self, other: SetbackFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SetbackFlags {
    type Output = SetbackFlags;
    fn bitor(self, rhs: SetbackFlags) -> SetbackFlags {
        SetbackFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SetbackFlags {
    fn bitor_assign(&mut self, rhs: SetbackFlags) {
        self.0 |= rhs.0;
    }
}

/// Reply returned to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// Same identifier as the request
    pub id: RequestId,
    /// Header + payload
    pub len: u32,
    pub cookie: Cookie,
    pub class: u8,
    pub opcode: u32,
    /// errno, 0 on success
    pub error: i32,
    pub setback: SetbackFlags,
    pub payload: Vec<u8>,
}

impl RawReply {
    /// Replace the payload, keeping `len` consistent
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.len = (HEADER_LEN + payload.len()) as u32;
        self.payload = payload;
    }
}
