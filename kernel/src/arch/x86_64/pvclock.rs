//! KVM pvclock: nanosecond time from the TSC.
//!
//! The hypervisor shares a per-vCPU record containing TSC scaling
//! parameters and a reference timestamp, updated under a seqlock: the low
//! bit of `version` is set while an update is in progress, and `version`
//! changes across every update. Readers retry until they observe a stable,
//! even version. Registration writes the record's physical address (with
//! the enable bit) to a KVM-specific MSR.

use core::sync::atomic::{fence, AtomicBool, Ordering};

use super::msr;

/// CPUID leaf holding the hypervisor signature.
const CPUID_HV_SIGNATURE: u32 = 0x4000_0000;
/// CPUID leaf holding the KVM feature bits.
const CPUID_KVM_FEATURES: u32 = 0x4000_0001;

/// KVM_FEATURE_CLOCKSOURCE: legacy MSR pair.
const KVM_FEATURE_CLOCKSOURCE: u32 = 1 << 0;
/// KVM_FEATURE_CLOCKSOURCE2: the 0x4B564D00-series MSRs.
const KVM_FEATURE_CLOCKSOURCE2: u32 = 1 << 3;

/// New-style system-time MSR.
const MSR_KVM_SYSTEM_TIME_NEW: u32 = 0x4B56_4D01;
/// Legacy system-time MSR.
const MSR_KVM_SYSTEM_TIME: u32 = 0x12;

/// The record KVM updates in guest memory.
///
/// Layout fixed by the KVM ABI; 32 bytes, must not straddle a page.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PvclockTimeInfo {
    pub version: u32,
    pub pad0: u32,
    pub tsc_timestamp: u64,
    pub system_time_ns: u64,
    pub tsc_to_system_mul: u32,
    pub tsc_shift: i8,
    pub flags: u8,
    pub pad: [u8; 2],
}

impl PvclockTimeInfo {
    pub const fn zeroed() -> Self {
        Self {
            version: 0,
            pad0: 0,
            tsc_timestamp: 0,
            system_time_ns: 0,
            tsc_to_system_mul: 0,
            tsc_shift: 0,
            flags: 0,
            pad: [0; 2],
        }
    }
}

/// Cache-line aligned so the 32-byte record can never straddle a page.
#[repr(C, align(64))]
struct AlignedRecord(PvclockTimeInfo);

static mut TIME_INFO: AlignedRecord = AlignedRecord(PvclockTimeInfo::zeroed());

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Scale a TSC delta into nanoseconds using the record's parameters:
/// shift first (left for non-negative shifts, right otherwise), then the
/// 32.32 fixed-point multiply.
pub fn scale_tsc_delta(delta: u64, mul: u32, shift: i8) -> u64 {
    let shifted = if shift >= 0 {
        delta << shift
    } else {
        delta >> (-shift)
    };
    ((shifted as u128 * mul as u128) >> 32) as u64
}

/// One seqlock-protected read of the record.
///
/// `tsc` must be sampled between the two version checks, which is why the
/// caller passes a sampling closure instead of a value.
pub fn read_record(record: *const PvclockTimeInfo, mut read_tsc: impl FnMut() -> u64) -> u64 {
    loop {
        // SAFETY: The record pointer is valid for the lifetime of the
        // kernel (a static) or of the test (a local). Volatile reads: the
        // hypervisor writes this memory behind the compiler's back.
        let version = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*record).version)) };
        if version & 1 != 0 {
            // Host update in progress
            core::hint::spin_loop();
            continue;
        }
        fence(Ordering::Acquire);

        // SAFETY: As above; field reads of the shared record.
        let (tsc_timestamp, system_time_ns, mul, shift) = unsafe {
            (
                core::ptr::read_volatile(core::ptr::addr_of!((*record).tsc_timestamp)),
                core::ptr::read_volatile(core::ptr::addr_of!((*record).system_time_ns)),
                core::ptr::read_volatile(core::ptr::addr_of!((*record).tsc_to_system_mul)),
                core::ptr::read_volatile(core::ptr::addr_of!((*record).tsc_shift)),
            )
        };

        let tsc = read_tsc();
        let delta = tsc.wrapping_sub(tsc_timestamp);
        let ns = system_time_ns + scale_tsc_delta(delta, mul, shift);

        fence(Ordering::Acquire);
        // SAFETY: As above.
        let version_after =
            unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*record).version)) };
        if version_after == version {
            return ns;
        }
        // Torn read; go around again.
    }
}

/// Detect the KVM clocksource and register our record page with the host.
pub fn init() {
    let (_, ebx, ecx, edx) = msr::cpuid(CPUID_HV_SIGNATURE);
    // "KVMKVMKVM\0\0\0" split across ebx/ecx/edx
    let is_kvm = ebx == 0x4B4D_564B && ecx == 0x564B_4D56 && edx == 0x4D56_4B4D;
    if !is_kvm {
        println!("[PVCLOCK] No KVM hypervisor signature; using PIT time only");
        return;
    }

    let (features, _, _, _) = msr::cpuid(CPUID_KVM_FEATURES);
    let msr_addr = if features & KVM_FEATURE_CLOCKSOURCE2 != 0 {
        MSR_KVM_SYSTEM_TIME_NEW
    } else if features & KVM_FEATURE_CLOCKSOURCE != 0 {
        MSR_KVM_SYSTEM_TIME
    } else {
        println!("[PVCLOCK] KVM present but no clocksource feature");
        return;
    };

    // Raw address only; no reference to the static mut is ever formed.
    let phys = &raw const TIME_INFO as u64;
    // Low bit enables updates; the kernel image is identity-mapped so the
    // record's virtual address is its physical address.
    msr::wrmsr(msr_addr, phys | 1);
    ENABLED.store(true, Ordering::Release);

    println!(
        "[PVCLOCK] Registered time record at {:#x} via MSR {:#x}",
        phys, msr_addr
    );
}

/// Whether a pvclock source was registered.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Current nanoseconds from the pvclock, or `None` when unavailable.
pub fn now_ns() -> Option<u64> {
    if !is_enabled() {
        return None;
    }
    // Raw address only; all access goes through volatile reads inside
    // read_record.
    let record = &raw const TIME_INFO as *const PvclockTimeInfo;
    Some(read_record(record, msr::rdtsc))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_scale_positive_shift() {
        // shift 2, mul 2^31 (= x0.5 after the >>32): (100 << 2) / 2 = 200
        assert_eq!(scale_tsc_delta(100, 1 << 31, 2), 200);
    }

    #[test]
    fn test_scale_negative_shift() {
        // shift -1, mul 2^32-ish: 1.0 multiplier keeps the halved delta
        assert_eq!(scale_tsc_delta(100, u32::MAX, -1), 49);
    }

    #[test]
    fn test_read_record_stable_version() {
        let record = PvclockTimeInfo {
            version: 2,
            pad0: 0,
            tsc_timestamp: 1_000,
            system_time_ns: 5_000,
            // 32.32 fixed point 1.0
            tsc_to_system_mul: 0,
            tsc_shift: 0,
            flags: 0,
            pad: [0; 2],
        };
        // mul 0 -> delta contributes nothing; result is system_time_ns
        let ns = read_record(&record, || 4_000);
        assert_eq!(ns, 5_000);
    }

    #[test]
    fn test_read_record_applies_delta() {
        let record = PvclockTimeInfo {
            version: 4,
            pad0: 0,
            tsc_timestamp: 0,
            system_time_ns: 0,
            // exactly 1.0 in 32.32 would be 1<<32 which overflows u32;
            // use 0.5 and a shift of 1 to express 1 ns per TSC unit.
            tsc_to_system_mul: 1 << 31,
            tsc_shift: 1,
            flags: 0,
            pad: [0; 2],
        };
        assert_eq!(read_record(&record, || 1234), 1234);
    }

    #[test]
    fn test_read_record_retries_on_version_change() {
        use core::cell::Cell;

        let record = Cell::new(PvclockTimeInfo {
            version: 2,
            pad0: 0,
            tsc_timestamp: 0,
            system_time_ns: 111,
            tsc_to_system_mul: 0,
            tsc_shift: 0,
            flags: 0,
            pad: [0; 2],
        });
        let calls = Cell::new(0u32);
        let ptr = record.as_ptr() as *const PvclockTimeInfo;
        let ns = read_record(ptr, || {
            // Simulate a host update racing the first read: bump the
            // version between the reader's two version samples.
            if calls.get() == 0 {
                let mut r = record.get();
                r.version = 4;
                r.system_time_ns = 222;
                record.set(r);
            }
            calls.set(calls.get() + 1);
            0
        });
        assert_eq!(ns, 222);
        assert!(calls.get() >= 2, "reader must have retried");
    }
}
