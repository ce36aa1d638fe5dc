//! The Data Vector: one typed, region-partitioned shared memory per node.
//!
//! Every subsystem on a node communicates exclusively through this structure.
//! Regions exist so that a node can ship exactly the sub-slice another node
//! needs in a single copy, without serialization; element types exist so that
//! reads catch mis-wiring at runtime instead of silently reinterpreting
//! bytes.
//!
//! The byte layout is little-endian and tightly packed: regions are laid out
//! in configuration order, elements within a region likewise, and the layout
//! is stable for the lifetime of the vector. The same byte image is what goes
//! on the wire, so sender and receiver must be built from the same config.

use core::cell::UnsafeCell;
use std::collections::HashMap;

use crate::errors::Error;

mod lock;
mod vector;

pub(crate) use lock::ErrorcheckMutex;

/// Closed `u32`-repr enumeration with a raw-value round trip.
///
/// Ids cross the process boundary (the `WRITE` ground command names its
/// target element by raw id), hence the explicit repr and `from_raw`.
macro_rules! closed_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $name {
            /// Recover the variant from its raw id.
            pub fn from_raw(raw: u32) -> Option<Self> {
                $(
                    if raw == Self::$variant as u32 {
                        return Some(Self::$variant);
                    }
                )+
                None
            }
        }
    };
}

pub(crate) use closed_enum;

closed_enum! {
    /// Every element any node in the network may carry.
    ///
    /// The enumeration is shared process-wide; each element belongs to
    /// exactly one region of exactly one Data Vector. The `Test*` ids are
    /// reserved for test configs, mirroring the flight convention of keeping
    /// the enumeration closed even for scaffolding.
    pub enum DvElem {
        // Control node bookkeeping.
        State,
        CnTimeNs,
        CnLoopCount,
        CnErrorCount,
        CnMsgTxCount,
        CnMsgRxCount,
        Dn0RxMissCount,
        Dn1RxMissCount,
        Dn2RxMissCount,
        // Command handler slots.
        Cmd,
        CmdProcessedSeq,
        CmdReq,
        CmdReqSeq,
        CmdWriteElem,
        CmdWriteVal,
        // Per-device downlink and uplink payloads.
        Dn0ActuatorCmd,
        Dn1ActuatorCmd,
        Dn2ActuatorCmd,
        Dn0SensorReading,
        Dn1SensorReading,
        Dn2SensorReading,
        Dn0LoopCount,
        Dn1LoopCount,
        Dn2LoopCount,
        // Test scaffolding.
        Test0,
        Test1,
        Test2,
        Test3,
        Test4,
        Test5,
        Test6,
        Test7,
        Test8,
        Test9,
        Test10,
        Test11,
        Test12,
        Test13,
        Test14,
        Test15,
    }
}

closed_enum! {
    /// Every region any node in the network may carry.
    pub enum DvRegion {
        Cn,
        CnToDn0,
        CnToDn1,
        CnToDn2,
        Dn0ToCn,
        Dn1ToCn,
        Dn2ToCn,
        GndToCn,
        Test0,
        Test1,
        Test2,
    }
}

/// The closed set of element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl ElemType {
    /// Byte width of one element of this type. Arrays are unsupported.
    pub fn width(self) -> usize {
        match self {
            ElemType::U8 | ElemType::I8 | ElemType::Bool => 1,
            ElemType::U16 | ElemType::I16 => 2,
            ElemType::U32 | ElemType::I32 | ElemType::F32 => 4,
            ElemType::U64 | ElemType::I64 | ElemType::F64 => 8,
        }
    }

    /// True for the eight integer types (the ones `increment` accepts).
    pub fn is_integer(self) -> bool {
        !matches!(self, ElemType::F32 | ElemType::F64 | ElemType::Bool)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A Rust value that can live in a Data Vector element.
///
/// The set is closed; the trait is the thin generic shell over the runtime
/// type tag that lets typed accessors reject mismatched access without any
/// reflection.
pub trait DvValue: Copy + sealed::Sealed {
    /// The runtime tag this type must match.
    const TYPE: ElemType;

    /// Serialize into exactly `TYPE.width()` little-endian bytes.
    fn write_le(self, out: &mut [u8]);

    /// Deserialize from exactly `TYPE.width()` little-endian bytes.
    fn read_le(src: &[u8]) -> Self;
}

macro_rules! impl_dv_value {
    ($($ty:ty => $tag:ident),+ $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl DvValue for $ty {
                const TYPE: ElemType = ElemType::$tag;

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn read_le(src: &[u8]) -> Self {
                    let mut bytes = [0u8; core::mem::size_of::<$ty>()];
                    bytes.copy_from_slice(src);
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )+
    };
}

impl_dv_value! {
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

impl sealed::Sealed for bool {}

impl DvValue for bool {
    const TYPE: ElemType = ElemType::Bool;

    fn write_le(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn read_le(src: &[u8]) -> Self {
        src[0] != 0
    }
}

/// One element in a region config.
///
/// The initial value is carried as a 64-bit bit pattern and reinterpreted to
/// the element's type when the buffer is initialized; the typed constructors
/// below do the packing.
#[derive(Debug, Clone, Copy)]
pub struct ElemConfig {
    pub elem: DvElem,
    pub ty: ElemType,
    pub init_bits: u64,
}

macro_rules! elem_config_ctor {
    ($($(#[$meta:meta])* $name:ident: $ty:ty => $tag:ident, $pack:expr);+ $(;)?) => {
        $(
            $(#[$meta])*
            pub fn $name(elem: DvElem, init: $ty) -> Self {
                let pack: fn($ty) -> u64 = $pack;
                ElemConfig { elem, ty: ElemType::$tag, init_bits: pack(init) }
            }
        )+
    };
}

impl ElemConfig {
    elem_config_ctor! {
        /// A `u8` element with its initial value.
        u8: u8 => U8, |v| v as u64;
        /// A `u16` element with its initial value.
        u16: u16 => U16, |v| v as u64;
        /// A `u32` element with its initial value.
        u32: u32 => U32, |v| v as u64;
        /// A `u64` element with its initial value.
        u64: u64 => U64, |v| v;
        /// An `i8` element with its initial value.
        i8: i8 => I8, |v| v as u8 as u64;
        /// An `i16` element with its initial value.
        i16: i16 => I16, |v| v as u16 as u64;
        /// An `i32` element with its initial value.
        i32: i32 => I32, |v| v as u32 as u64;
        /// An `i64` element with its initial value.
        i64: i64 => I64, |v| v as u64;
        /// An `f32` element with its initial value.
        f32: f32 => F32, |v| v.to_bits() as u64;
        /// An `f64` element with its initial value.
        f64: f64 => F64, |v| v.to_bits();
        /// A `bool` element with its initial value.
        bool: bool => Bool, |v| v as u64;
    }
}

/// One region in a Data Vector config: an id plus its elements in layout
/// order.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub region: DvRegion,
    pub elems: Vec<ElemConfig>,
}

/// A whole Data Vector config: regions in layout order.
pub type DvConfig = Vec<RegionConfig>;

/// Layout record for one element.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemInfo {
    pub(crate) ty: ElemType,
    pub(crate) offset: usize,
}

/// Layout record for one region.
#[derive(Debug, Clone)]
pub(crate) struct RegionInfo {
    pub(crate) offset: usize,
    pub(crate) size_bytes: usize,
    pub(crate) elems: Vec<DvElem>,
}

/// The Data Vector proper.
///
/// Owns its byte buffer exclusively; regions and elements are views described
/// by offsets in the side tables, never independent allocations. A single
/// error-checking mutex guards the buffer; every public accessor acquires and
/// releases it around the copy, so concurrent readers and writers never
/// observe a torn element.
pub struct DataVector {
    pub(crate) mutex: ErrorcheckMutex,
    pub(crate) buf: UnsafeCell<Box<[u8]>>,
    pub(crate) elems: HashMap<DvElem, ElemInfo>,
    pub(crate) regions: HashMap<DvRegion, RegionInfo>,
    pub(crate) total_bytes: usize,
}

// The buffer is only ever touched with the mutex held; the side tables are
// immutable after construction.
unsafe impl Send for DataVector {}
unsafe impl Sync for DataVector {}

impl core::fmt::Debug for DataVector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataVector")
            .field("regions", &self.regions.len())
            .field("elems", &self.elems.len())
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

/// Increment the error counter element when `res` is an error, swallowing the
/// result either way. The periodic loop surfaces step failures this way
/// instead of aborting.
pub fn increment_on_error(res: Result<(), Error>, dv: &DataVector, counter: DvElem) {
    if let Err(err) = res {
        log::debug!("loop step failed: {err}");
        if dv.increment(counter).is_err() {
            log::error!("error counter {counter:?} could not be incremented");
        }
    }
}
