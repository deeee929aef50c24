//! Synthetic device fingerprint written to `device.json` before the protocol
//! client starts.
//!
//! Hardware description fields are fixed literals for one emulated handset;
//! the remote network validates them for internal consistency, not uniqueness.
//! Addresses and identifiers are random. All randomness is seeded from the OS
//! entropy source, which is the only failure this module reports.

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint_contract::DeviceProtocol;

const IMEI_DIGITS: usize = 15;
const LOCALLY_ADMINISTERED_BIT: u8 = 0x02;

#[derive(Debug, Error)]
/// Enumerates supported `DeviceIdentityError` values.
pub enum DeviceIdentityError {
    #[error("operating system entropy source unavailable: {0}")]
    EntropyUnavailable(#[from] rand::Error),
    #[error("failed to serialize device identity: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// OS version block nested in the device record.
pub struct DeviceOsVersion {
    pub incremental: String,
    pub release: String,
    pub codename: String,
    pub sdk: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// On-disk device record consumed by the protocol client.
pub struct DeviceIdentity {
    pub display: String,
    pub product: String,
    pub device: String,
    pub board: String,
    pub model: String,
    pub finger_print: String,
    pub boot_id: String,
    pub proc_version: String,
    pub protocol: DeviceProtocol,
    pub imei: String,
    pub brand: String,
    pub bootloader: String,
    pub base_band: String,
    pub sim_info: String,
    pub os_type: String,
    pub mac_address: String,
    pub ip_address: [u8; 4],
    pub wifi_bssid: String,
    pub wifi_ssid: String,
    pub imsi_md5: String,
    pub android_id: String,
    pub apn: String,
    pub vendor_name: String,
    pub vendor_os_name: String,
    pub version: DeviceOsVersion,
}

impl DeviceIdentity {
    pub fn to_json(&self) -> Result<String, DeviceIdentityError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Generates a fresh identity seeded from the OS entropy source.
pub fn generate_device_identity(
    protocol: DeviceProtocol,
) -> Result<DeviceIdentity, DeviceIdentityError> {
    let mut seed = <StdRng as SeedableRng>::Seed::default();
    OsRng.try_fill_bytes(&mut seed)?;
    let mut rng = StdRng::from_seed(seed);
    Ok(generate_device_identity_with_rng(protocol, &mut rng))
}

/// Deterministic variant for callers that bring their own generator.
pub fn generate_device_identity_with_rng<R: Rng + ?Sized>(
    protocol: DeviceProtocol,
    rng: &mut R,
) -> DeviceIdentity {
    let mut boot_id = [0_u8; 16];
    rng.fill_bytes(&mut boot_id);
    let mac_address = random_mac_address(rng);
    let wifi_bssid = random_mac_address(rng);
    // Only has to pass client-side checksum validation; it is not a
    // manufacturer-assigned IMEI.
    let imei = random_luhn_number(rng, IMEI_DIGITS);
    let ip_address = [192, 168, rng.gen_range(0..255), rng.gen_range(2..255)];
    let android_id = format!("{:X}", rng.gen::<u64>());

    DeviceIdentity {
        display: "MIUI V9.5.3.0".to_string(),
        product: "sagit".to_string(),
        device: "sagit".to_string(),
        board: "msm8998".to_string(),
        model: "MI 6".to_string(),
        finger_print: "Xiaomi/sagit/sagit:8.0.0/OPR1.170623.027/V9.5.3.0.OCACNFA:user/release-keys"
            .to_string(),
        boot_id: uuid::Builder::from_random_bytes(boot_id)
            .into_uuid()
            .to_string(),
        proc_version: "Linux version 3.10.61-7254923".to_string(),
        protocol,
        imei,
        brand: "Xiaomi".to_string(),
        bootloader: "unknown".to_string(),
        base_band: String::new(),
        sim_info: String::new(),
        os_type: "android".to_string(),
        mac_address,
        ip_address,
        wifi_bssid,
        wifi_ssid: "<unknown ssid>".to_string(),
        imsi_md5: String::new(),
        android_id,
        apn: "wifi".to_string(),
        vendor_name: "MIUI".to_string(),
        vendor_os_name: "xiaomi".to_string(),
        version: DeviceOsVersion {
            incremental: "OCACNFA".to_string(),
            release: "11".to_string(),
            codename: "REL".to_string(),
            sdk: 29,
        },
    }
}

fn random_mac_address<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mut octets = [0_u8; 6];
    rng.fill_bytes(&mut octets);
    octets[0] |= LOCALLY_ADMINISTERED_BIT;
    octets
        .iter()
        .map(|octet| format!("{octet:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn random_luhn_number<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    let payload_len = length.saturating_sub(1);
    let mut digits: Vec<u8> = (0..payload_len).map(|_| rng.gen_range(0..10)).collect();
    digits.push(luhn_check_digit(&digits));
    digits.iter().map(|digit| char::from(b'0' + digit)).collect()
}

fn luhn_check_digit(payload: &[u8]) -> u8 {
    let sum: u32 = payload
        .iter()
        .rev()
        .enumerate()
        .map(|(index, digit)| {
            let digit = u32::from(*digit);
            if index % 2 == 0 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                digit
            }
        })
        .sum();
    ((10 - (sum % 10)) % 10) as u8
}

/// Returns true when `number` is all ASCII digits and passes the Luhn checksum.
pub fn passes_luhn_checksum(number: &str) -> bool {
    if number.is_empty() || !number.bytes().all(|byte| byte.is_ascii_digit()) {
        return false;
    }
    let digits: Vec<u8> = number.bytes().map(|byte| byte - b'0').collect();
    let (payload, check) = digits.split_at(digits.len() - 1);
    luhn_check_digit(payload) == check[0]
}
