//! Batch partitioning
//!
//! Splits a device list into bounded chunks. Devices with static or
//! seed-derived credentials chunk freely; manual-OTP devices are grouped
//! strictly by (department, device group) so one human-entered code covers
//! each dispatched chunk.

use std::collections::HashMap;

use netrun_core::{AuthBucket, BatchBucket, Device, NetrunError, Result};

/// Partition `devices` into dispatchable buckets
///
/// Output order: non-OTP chunks first, then manual-OTP buckets in
/// (dept, group) first-seen order. Devices keep their relative input
/// order within a bucket. A manual-OTP device missing its department or
/// group is a hard input error - no partial output.
pub fn partition(devices: Vec<Device>, chunk_size: usize) -> Result<Vec<BatchBucket>> {
    if chunk_size == 0 {
        return Err(NetrunError::Config("chunk_size must be positive".to_string()));
    }

    // Validate before building anything
    for device in &devices {
        if device.credential.is_manual_otp() && device.otp_group().is_none() {
            return Err(NetrunError::InvalidDevice(format!(
                "manual-OTP device {} is missing department or device group",
                device.id
            )));
        }
    }

    let mut standard: Vec<Device> = Vec::new();
    let mut otp_order: Vec<(String, String)> = Vec::new();
    let mut otp_groups: HashMap<(String, String), Vec<Device>> = HashMap::new();

    for device in devices {
        if device.credential.is_manual_otp() {
            // Validated above
            let (dept, group) = device
                .otp_group()
                .map(|(d, g)| (d.to_string(), g.to_string()))
                .expect("manual-OTP device validated");
            let key = (dept, group);
            if !otp_groups.contains_key(&key) {
                otp_order.push(key.clone());
            }
            otp_groups.entry(key).or_default().push(device);
        } else {
            standard.push(device);
        }
    }

    let mut buckets = Vec::new();
    slice_into_buckets(&mut buckets, standard, AuthBucket::Standard, None, None, chunk_size);

    for key in otp_order {
        let group_devices = otp_groups.remove(&key).unwrap_or_default();
        let (dept, group) = key;
        slice_into_buckets(
            &mut buckets,
            group_devices,
            AuthBucket::ManualOtp,
            Some(dept),
            Some(group),
            chunk_size,
        );
    }

    tracing::debug!("Partitioned job into {} buckets", buckets.len());
    Ok(buckets)
}

fn slice_into_buckets(
    buckets: &mut Vec<BatchBucket>,
    devices: Vec<Device>,
    auth_bucket: AuthBucket,
    dept_id: Option<String>,
    device_group: Option<String>,
    chunk_size: usize,
) {
    if devices.is_empty() {
        return;
    }
    let group_total = devices.len();
    let batch_total = group_total.div_ceil(chunk_size);

    let mut devices = devices;
    let mut batch_index = 0;
    while !devices.is_empty() {
        let rest = devices.split_off(devices.len().min(chunk_size));
        buckets.push(BatchBucket {
            auth_bucket,
            dept_id: dept_id.clone(),
            device_group: device_group.clone(),
            devices,
            batch_index,
            batch_total,
            group_total,
        });
        devices = rest;
        batch_index += 1;
    }
}
