//! Construction, typed access, and bulk access for [`DataVector`].

use core::cell::UnsafeCell;
use std::collections::HashMap;

use crate::dv::{
    DataVector, DvElem, DvRegion, DvValue, ElemInfo, ElemType, ErrorcheckMutex, RegionConfig,
    RegionInfo,
};
use crate::errors::Error;

impl DataVector {
    /// Build a Data Vector from an immutable config.
    ///
    /// Validation order: non-empty config, unique region ids, then per
    /// region a non-empty element list with ids unique across the whole
    /// vector. The buffer is initialized from each element's 64-bit init
    /// pattern reinterpreted to its type.
    pub fn new(config: &[RegionConfig]) -> Result<DataVector, Error> {
        if config.is_empty() {
            return Err(Error::InvalidConfig);
        }

        let mut seen_regions = std::collections::HashSet::new();
        for region_config in config {
            if !seen_regions.insert(region_config.region) {
                return Err(Error::DuplicateRegion);
            }
        }

        let mut elems = HashMap::new();
        let mut regions = HashMap::new();
        let mut offset = 0usize;

        for region_config in config {
            if region_config.elems.is_empty() {
                return Err(Error::InvalidConfig);
            }

            let region_start = offset;
            let mut ids = Vec::with_capacity(region_config.elems.len());
            for elem_config in &region_config.elems {
                if elems.contains_key(&elem_config.elem) {
                    return Err(Error::DuplicateElem);
                }
                elems.insert(
                    elem_config.elem,
                    ElemInfo {
                        ty: elem_config.ty,
                        offset,
                    },
                );
                ids.push(elem_config.elem);
                offset += elem_config.ty.width();
            }

            regions.insert(
                region_config.region,
                RegionInfo {
                    offset: region_start,
                    size_bytes: offset - region_start,
                    elems: ids,
                },
            );
        }

        let mut buf = vec![0u8; offset].into_boxed_slice();
        for region_config in config {
            for elem_config in &region_config.elems {
                let info = elems[&elem_config.elem];
                let width = info.ty.width();
                buf[info.offset..info.offset + width]
                    .copy_from_slice(&elem_config.init_bits.to_le_bytes()[..width]);
            }
        }

        Ok(DataVector {
            mutex: ErrorcheckMutex::new()?,
            buf: UnsafeCell::new(buf),
            elems,
            regions,
            total_bytes: offset,
        })
    }

    /// Typed read of one element. The stored type must match `T` exactly; no
    /// implicit widening.
    pub fn read<T: DvValue>(&self, elem: DvElem) -> Result<T, Error> {
        let info = self.elem_info(elem)?;
        if info.ty != T::TYPE {
            return Err(Error::TypeMismatch);
        }
        let offset = info.offset;
        let width = info.ty.width();
        self.with_lock(|buf| T::read_le(&buf[offset..offset + width]))
    }

    /// Typed write of one element. The stored type must match `T` exactly.
    pub fn write<T: DvValue>(&self, elem: DvElem, value: T) -> Result<(), Error> {
        let info = self.elem_info(elem)?;
        if info.ty != T::TYPE {
            return Err(Error::TypeMismatch);
        }
        let offset = info.offset;
        let width = info.ty.width();
        self.with_lock(|buf| value.write_le(&mut buf[offset..offset + width]))
    }

    /// Write an element from a 64-bit bit pattern reinterpreted to its
    /// configured type, exactly as initial values are applied. This is the
    /// entry point for the ground `WRITE` command, which names its target by
    /// raw element id and so cannot be statically typed.
    pub fn write_bits(&self, elem: DvElem, bits: u64) -> Result<(), Error> {
        let info = self.elem_info(elem)?;
        let offset = info.offset;
        let width = info.ty.width();
        self.with_lock(|buf| {
            buf[offset..offset + width].copy_from_slice(&bits.to_le_bytes()[..width])
        })
    }

    /// Add one to an integer element, wrapping at its width. Counters are
    /// modulo `2^width` by contract.
    pub fn increment(&self, elem: DvElem) -> Result<(), Error> {
        let info = self.elem_info(elem)?;
        if !info.ty.is_integer() {
            return Err(Error::TypeMismatch);
        }
        let offset = info.offset;
        let width = info.ty.width();
        self.with_lock(|buf| {
            let bytes = &mut buf[offset..offset + width];
            match info.ty {
                ElemType::U8 => u8::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::U16 => u16::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::U32 => u32::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::U64 => u64::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::I8 => i8::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::I16 => i16::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::I32 => i32::read_le(bytes).wrapping_add(1).write_le(bytes),
                ElemType::I64 => i64::read_le(bytes).wrapping_add(1).write_le(bytes),
                _ => {}
            }
        })
    }

    /// Copy a region's byte image into `out`, whose length must equal the
    /// region's stored size.
    pub fn read_region(&self, region: DvRegion, out: &mut [u8]) -> Result<(), Error> {
        let info = self.region_info(region)?;
        if out.len() != info.size_bytes {
            return Err(Error::SizeMismatch);
        }
        let offset = info.offset;
        let size = info.size_bytes;
        self.with_lock(|buf| out.copy_from_slice(&buf[offset..offset + size]))
    }

    /// Overwrite a region from `src`, whose length must equal the region's
    /// stored size.
    pub fn write_region(&self, region: DvRegion, src: &[u8]) -> Result<(), Error> {
        let info = self.region_info(region)?;
        if src.len() != info.size_bytes {
            return Err(Error::SizeMismatch);
        }
        let offset = info.offset;
        let size = info.size_bytes;
        self.with_lock(|buf| buf[offset..offset + size].copy_from_slice(src))
    }

    /// Copy the entire buffer into `out` (the telemetry snapshot shape).
    pub fn read_all(&self, out: &mut [u8]) -> Result<(), Error> {
        if out.len() != self.total_bytes {
            return Err(Error::SizeMismatch);
        }
        self.with_lock(|buf| out.copy_from_slice(buf))
    }

    /// Stored byte size of a region.
    pub fn region_size_bytes(&self, region: DvRegion) -> Result<usize, Error> {
        Ok(self.region_info(region)?.size_bytes)
    }

    /// The elements of a region, in layout order.
    pub fn region_elems(&self, region: DvRegion) -> Result<&[DvElem], Error> {
        Ok(&self.region_info(region)?.elems)
    }

    /// Total byte size of the vector.
    pub fn total_size_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Whether the element is configured. Pure config probe, no lock taken.
    pub fn element_exists(&self, elem: DvElem) -> Result<(), Error> {
        self.elem_info(elem).map(|_| ())
    }

    /// The configured type of an element. Pure config probe, no lock taken.
    pub fn elem_type(&self, elem: DvElem) -> Result<ElemType, Error> {
        Ok(self.elem_info(elem)?.ty)
    }

    /// Acquire the vector's lock for a composite critical section.
    ///
    /// Re-acquisition by the holding thread reports
    /// [`Error::AlreadyLocked`]; the typed accessors take the lock
    /// themselves, so do not call them from inside the section.
    pub fn lock(&self) -> Result<(), Error> {
        self.mutex.lock()
    }

    /// Release the vector's lock. Release by a thread that does not hold it
    /// reports [`Error::NotHeld`].
    pub fn unlock(&self) -> Result<(), Error> {
        self.mutex.unlock()
    }

    fn elem_info(&self, elem: DvElem) -> Result<&ElemInfo, Error> {
        self.elems.get(&elem).ok_or(Error::InvalidElem)
    }

    fn region_info(&self, region: DvRegion) -> Result<&RegionInfo, Error> {
        self.regions.get(&region).ok_or(Error::InvalidRegion)
    }

    fn with_lock<R>(&self, body: impl FnOnce(&mut [u8]) -> R) -> Result<R, Error> {
        self.mutex.lock()?;
        // Exclusive access for the duration: every other path to the buffer
        // also goes through this mutex.
        let out = body(unsafe { &mut **self.buf.get() });
        self.mutex.unlock()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dv::ElemConfig;

    fn two_region_config() -> Vec<RegionConfig> {
        vec![
            RegionConfig {
                region: DvRegion::Test0,
                elems: vec![
                    ElemConfig::u8(DvElem::Test0, 0),
                    ElemConfig::bool(DvElem::Test1, true),
                ],
            },
            RegionConfig {
                region: DvRegion::Test1,
                elems: vec![ElemConfig::f32(DvElem::Test2, 1.23)],
            },
        ]
    }

    #[test]
    fn empty_config_rejected() {
        assert_eq!(DataVector::new(&[]).err(), Some(Error::InvalidConfig));
    }

    #[test]
    fn empty_elem_list_rejected() {
        let config = vec![RegionConfig {
            region: DvRegion::Test0,
            elems: vec![],
        }];
        assert_eq!(DataVector::new(&config).err(), Some(Error::InvalidConfig));
    }

    #[test]
    fn duplicate_region_rejected() {
        let config = vec![
            RegionConfig {
                region: DvRegion::Test0,
                elems: vec![ElemConfig::u8(DvElem::Test0, 0)],
            },
            RegionConfig {
                region: DvRegion::Test0,
                elems: vec![ElemConfig::u8(DvElem::Test1, 0)],
            },
        ];
        assert_eq!(DataVector::new(&config).err(), Some(Error::DuplicateRegion));
    }

    #[test]
    fn duplicate_elem_across_regions_rejected() {
        let config = vec![
            RegionConfig {
                region: DvRegion::Test0,
                elems: vec![ElemConfig::u8(DvElem::Test0, 0)],
            },
            RegionConfig {
                region: DvRegion::Test1,
                elems: vec![ElemConfig::u16(DvElem::Test0, 0)],
            },
        ];
        assert_eq!(DataVector::new(&config).err(), Some(Error::DuplicateElem));
    }

    #[test]
    fn typed_access() {
        let dv = DataVector::new(&[RegionConfig {
            region: DvRegion::Test0,
            elems: vec![
                ElemConfig::u8(DvElem::Test0, 0),
                ElemConfig::bool(DvElem::Test1, true),
            ],
        }])
        .unwrap();

        assert_eq!(dv.read::<u8>(DvElem::Test0).unwrap(), 0);
        dv.write::<u8>(DvElem::Test0, 7).unwrap();
        assert_eq!(dv.read::<u8>(DvElem::Test0).unwrap(), 7);
        assert_eq!(dv.read::<bool>(DvElem::Test1).unwrap(), true);

        // Exact type required, no widening.
        assert_eq!(dv.read::<bool>(DvElem::Test0).err(), Some(Error::TypeMismatch));
        assert_eq!(dv.read::<u16>(DvElem::Test0).err(), Some(Error::TypeMismatch));
        assert_eq!(dv.write::<u16>(DvElem::Test0, 1).err(), Some(Error::TypeMismatch));

        // Unknown element.
        assert_eq!(dv.read::<u8>(DvElem::Test9).err(), Some(Error::InvalidElem));
        assert_eq!(dv.element_exists(DvElem::Test9).err(), Some(Error::InvalidElem));
        dv.element_exists(DvElem::Test0).unwrap();
    }

    #[test]
    fn every_type_round_trips() {
        let dv = DataVector::new(&[RegionConfig {
            region: DvRegion::Test0,
            elems: vec![
                ElemConfig::u8(DvElem::Test0, 0),
                ElemConfig::u16(DvElem::Test1, 0),
                ElemConfig::u32(DvElem::Test2, 0),
                ElemConfig::u64(DvElem::Test3, 0),
                ElemConfig::i8(DvElem::Test4, 0),
                ElemConfig::i16(DvElem::Test5, 0),
                ElemConfig::i32(DvElem::Test6, 0),
                ElemConfig::i64(DvElem::Test7, 0),
                ElemConfig::f32(DvElem::Test8, 0.0),
                ElemConfig::f64(DvElem::Test9, 0.0),
                ElemConfig::bool(DvElem::Test10, false),
            ],
        }])
        .unwrap();

        dv.write::<u8>(DvElem::Test0, 0xAB).unwrap();
        dv.write::<u16>(DvElem::Test1, 0xABCD).unwrap();
        dv.write::<u32>(DvElem::Test2, 0xDEAD_BEEF).unwrap();
        dv.write::<u64>(DvElem::Test3, u64::MAX - 1).unwrap();
        dv.write::<i8>(DvElem::Test4, -7).unwrap();
        dv.write::<i16>(DvElem::Test5, -30_000).unwrap();
        dv.write::<i32>(DvElem::Test6, i32::MIN).unwrap();
        dv.write::<i64>(DvElem::Test7, i64::MIN + 1).unwrap();
        dv.write::<f32>(DvElem::Test8, -1.1).unwrap();
        dv.write::<f64>(DvElem::Test9, 6.02e23).unwrap();
        dv.write::<bool>(DvElem::Test10, true).unwrap();

        assert_eq!(dv.read::<u8>(DvElem::Test0).unwrap(), 0xAB);
        assert_eq!(dv.read::<u16>(DvElem::Test1).unwrap(), 0xABCD);
        assert_eq!(dv.read::<u32>(DvElem::Test2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(dv.read::<u64>(DvElem::Test3).unwrap(), u64::MAX - 1);
        assert_eq!(dv.read::<i8>(DvElem::Test4).unwrap(), -7);
        assert_eq!(dv.read::<i16>(DvElem::Test5).unwrap(), -30_000);
        assert_eq!(dv.read::<i32>(DvElem::Test6).unwrap(), i32::MIN);
        assert_eq!(dv.read::<i64>(DvElem::Test7).unwrap(), i64::MIN + 1);
        assert_eq!(dv.read::<f32>(DvElem::Test8).unwrap(), -1.1);
        assert_eq!(dv.read::<f64>(DvElem::Test9).unwrap(), 6.02e23);
        assert_eq!(dv.read::<bool>(DvElem::Test10).unwrap(), true);
    }

    #[test]
    fn initial_values_applied() {
        let dv = DataVector::new(&[RegionConfig {
            region: DvRegion::Test0,
            elems: vec![
                ElemConfig::i16(DvElem::Test0, -42),
                ElemConfig::f64(DvElem::Test1, 2.5),
                ElemConfig::bool(DvElem::Test2, true),
            ],
        }])
        .unwrap();
        assert_eq!(dv.read::<i16>(DvElem::Test0).unwrap(), -42);
        assert_eq!(dv.read::<f64>(DvElem::Test1).unwrap(), 2.5);
        assert_eq!(dv.read::<bool>(DvElem::Test2).unwrap(), true);
    }

    #[test]
    fn layout_sizes_and_snapshot() {
        let dv = DataVector::new(&two_region_config()).unwrap();

        assert_eq!(dv.region_size_bytes(DvRegion::Test0).unwrap(), 2);
        assert_eq!(dv.region_size_bytes(DvRegion::Test1).unwrap(), 4);
        assert_eq!(dv.total_size_bytes(), 6);
        assert_eq!(dv.region_size_bytes(DvRegion::Test2).err(), Some(Error::InvalidRegion));
        assert_eq!(
            dv.region_elems(DvRegion::Test0).unwrap(),
            [DvElem::Test0, DvElem::Test1]
        );

        // read_all returns regions concatenated in declared order.
        let mut all = vec![0u8; 6];
        dv.read_all(&mut all).unwrap();
        let mut r0 = vec![0u8; 2];
        let mut r1 = vec![0u8; 4];
        dv.read_region(DvRegion::Test0, &mut r0).unwrap();
        dv.read_region(DvRegion::Test1, &mut r1).unwrap();
        assert_eq!(&all[..2], &r0[..]);
        assert_eq!(&all[2..], &r1[..]);
    }

    #[test]
    fn region_write_read_identity() {
        let dv = DataVector::new(&two_region_config()).unwrap();
        dv.write::<u8>(DvElem::Test0, 9).unwrap();

        let mut before = vec![0u8; dv.total_size_bytes()];
        dv.read_all(&mut before).unwrap();

        // Read a region and write it straight back: bitwise no-op.
        let mut image = vec![0u8; dv.region_size_bytes(DvRegion::Test0).unwrap()];
        dv.read_region(DvRegion::Test0, &mut image).unwrap();
        dv.write_region(DvRegion::Test0, &image).unwrap();

        let mut after = vec![0u8; dv.total_size_bytes()];
        dv.read_all(&mut after).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn bulk_size_mismatches_rejected() {
        let dv = DataVector::new(&two_region_config()).unwrap();
        let mut short = vec![0u8; 1];
        assert_eq!(
            dv.read_region(DvRegion::Test0, &mut short).err(),
            Some(Error::SizeMismatch)
        );
        assert_eq!(
            dv.write_region(DvRegion::Test0, &short).err(),
            Some(Error::SizeMismatch)
        );
        assert_eq!(dv.read_all(&mut short).err(), Some(Error::SizeMismatch));
    }

    #[test]
    fn increment_wraps() {
        let dv = DataVector::new(&[RegionConfig {
            region: DvRegion::Test0,
            elems: vec![
                ElemConfig::u8(DvElem::Test0, 255),
                ElemConfig::i8(DvElem::Test1, i8::MAX),
                ElemConfig::f32(DvElem::Test2, 0.0),
            ],
        }])
        .unwrap();

        dv.increment(DvElem::Test0).unwrap();
        assert_eq!(dv.read::<u8>(DvElem::Test0).unwrap(), 0);
        dv.increment(DvElem::Test1).unwrap();
        assert_eq!(dv.read::<i8>(DvElem::Test1).unwrap(), i8::MIN);
        assert_eq!(dv.increment(DvElem::Test2).err(), Some(Error::TypeMismatch));
    }

    #[test]
    fn write_bits_reinterprets() {
        let dv = DataVector::new(&two_region_config()).unwrap();
        dv.write_bits(DvElem::Test2, f32::to_bits(-3.5) as u64).unwrap();
        assert_eq!(dv.read::<f32>(DvElem::Test2).unwrap(), -3.5);
        dv.write_bits(DvElem::Test0, 0x1_07).unwrap();
        // Only the low byte lands in a one-byte element.
        assert_eq!(dv.read::<u8>(DvElem::Test0).unwrap(), 0x07);
    }

    #[test]
    fn lock_semantics() {
        let dv = DataVector::new(&two_region_config()).unwrap();
        dv.lock().unwrap();
        assert_eq!(dv.lock().err(), Some(Error::AlreadyLocked));
        // Accessors take the lock themselves, so they refuse to run while
        // the calling thread already holds it.
        assert_eq!(dv.read::<u8>(DvElem::Test0).err(), Some(Error::AlreadyLocked));
        dv.unlock().unwrap();
        assert_eq!(dv.unlock().err(), Some(Error::NotHeld));
        dv.read::<u8>(DvElem::Test0).unwrap();
    }

    #[test]
    fn no_torn_reads_under_contention() {
        let dv = Arc::new(
            DataVector::new(&[RegionConfig {
                region: DvRegion::Test0,
                elems: vec![ElemConfig::u64(DvElem::Test0, 0)],
            }])
            .unwrap(),
        );

        // Writers alternate two full-width patterns; readers must only ever
        // observe one of them.
        const A: u64 = 0x1111_1111_1111_1111;
        const B: u64 = 0xFFFF_FFFF_FFFF_FFFF;
        dv.write::<u64>(DvElem::Test0, A).unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let dv = Arc::clone(&dv);
            handles.push(std::thread::spawn(move || {
                for i in 0..2000u32 {
                    let v = if i % 2 == 0 { A } else { B };
                    dv.write::<u64>(DvElem::Test0, v).unwrap();
                }
            }));
        }
        for _ in 0..2 {
            let dv = Arc::clone(&dv);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    let v = dv.read::<u64>(DvElem::Test0).unwrap();
                    assert!(v == A || v == B, "torn read: {v:#x}");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        macro_rules! roundtrip {
            ($name:ident, $ty:ty, $ctor:ident) => {
                proptest! {
                    #[test]
                    fn $name(init in any::<$ty>(), value in any::<$ty>()) {
                        let dv = DataVector::new(&[RegionConfig {
                            region: DvRegion::Test0,
                            elems: vec![ElemConfig::$ctor(DvElem::Test0, init)],
                        }])
                        .unwrap();
                        prop_assert_eq!(dv.read::<$ty>(DvElem::Test0).unwrap(), init);
                        dv.write::<$ty>(DvElem::Test0, value).unwrap();
                        prop_assert_eq!(dv.read::<$ty>(DvElem::Test0).unwrap(), value);
                    }
                }
            };
        }

        roundtrip!(roundtrip_u8, u8, u8);
        roundtrip!(roundtrip_u16, u16, u16);
        roundtrip!(roundtrip_u32, u32, u32);
        roundtrip!(roundtrip_u64, u64, u64);
        roundtrip!(roundtrip_i8, i8, i8);
        roundtrip!(roundtrip_i16, i16, i16);
        roundtrip!(roundtrip_i32, i32, i32);
        roundtrip!(roundtrip_i64, i64, i64);
        roundtrip!(roundtrip_bool, bool, bool);

        proptest! {
            // Floats separately: NaN breaks equality, bit patterns do not.
            #[test]
            fn roundtrip_f32(value in any::<f32>()) {
                let dv = DataVector::new(&[RegionConfig {
                    region: DvRegion::Test0,
                    elems: vec![ElemConfig::f32(DvElem::Test0, 0.0)],
                }])
                .unwrap();
                dv.write::<f32>(DvElem::Test0, value).unwrap();
                prop_assert_eq!(
                    dv.read::<f32>(DvElem::Test0).unwrap().to_bits(),
                    value.to_bits()
                );
            }

            #[test]
            fn roundtrip_f64(value in any::<f64>()) {
                let dv = DataVector::new(&[RegionConfig {
                    region: DvRegion::Test0,
                    elems: vec![ElemConfig::f64(DvElem::Test0, 0.0)],
                }])
                .unwrap();
                dv.write::<f64>(DvElem::Test0, value).unwrap();
                prop_assert_eq!(
                    dv.read::<f64>(DvElem::Test0).unwrap().to_bits(),
                    value.to_bits()
                );
            }

            #[test]
            fn region_image_write_back_is_identity(bytes in proptest::collection::vec(any::<u8>(), 7)) {
                let dv = DataVector::new(&[RegionConfig {
                    region: DvRegion::Test0,
                    elems: vec![
                        ElemConfig::u16(DvElem::Test0, 0),
                        ElemConfig::u32(DvElem::Test1, 0),
                        ElemConfig::bool(DvElem::Test2, false),
                    ],
                }])
                .unwrap();
                prop_assert_eq!(dv.total_size_bytes(), 7);

                dv.write_region(DvRegion::Test0, &bytes).unwrap();
                let mut out = vec![0u8; 7];
                dv.read_region(DvRegion::Test0, &mut out).unwrap();
                prop_assert_eq!(out, bytes);
            }
        }
    }
}
