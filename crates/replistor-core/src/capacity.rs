use crate::error::{DriverError, Result};

/// Backend units (KiB) per system unit (GiB)
pub const KIB_PER_GIB: u64 = 1024 * 1024;

/// Convert a system size in GiB to backend KiB.
///
/// Exact for every whole GiB. Zero and values that would overflow are
/// rejected with `InvalidSize`.
pub fn to_backend_units(gib: u64) -> Result<u64> {
    if gib == 0 {
        return Err(DriverError::invalid_size(gib));
    }
    gib.checked_mul(KIB_PER_GIB)
        .ok_or_else(|| DriverError::invalid_size(gib))
}

/// Convert a backend size in KiB to system GiB.
///
/// Partial GiB round up: 1 KiB reports as 1 GiB, never 0.
pub fn to_system_units(kib: u64) -> Result<u64> {
    if kib == 0 {
        return Err(DriverError::invalid_size(kib));
    }
    Ok(kib.div_ceil(KIB_PER_GIB))
}

/// Signed difference in backend units between two system sizes
pub fn backend_delta(old_gib: u64, new_gib: u64) -> Result<i64> {
    let old = to_backend_units(old_gib)?;
    let new = to_backend_units(new_gib)?;
    let old = i64::try_from(old).map_err(|_| DriverError::invalid_size(old_gib))?;
    let new = i64::try_from(new).map_err(|_| DriverError::invalid_size(new_gib))?;
    Ok(new - old)
}
