//! BLE Service and Characteristic UUIDs.
//!
//! ELM327 clones expose a transparent serial link over GATT. Vendors disagree
//! on the layout, so the common ones are listed here.

use uuid::Uuid;

// Single-characteristic layout (write and notify on the same handle)
/// Serial service used by the ELM327 adapters this crate targets by default.
pub const ELM327_SERVICE_UUID: Uuid = Uuid::from_u128(0xe781_0a71_73ae_499d_8c15_faa9aef0c3f2);
/// Read/write/notify characteristic of [`ELM327_SERVICE_UUID`].
pub const ELM327_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbef8_d6c9_9c21_4c9e_b632_bd58c1009f9f);

// FFF0 layout (separate notify and write characteristics)
/// `FFF0` serial service.
pub const FFF0_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fff0_0000_1000_8000_00805f9b34fb);
/// `FFF1` characteristic (notify, adapter to host).
pub const FFF1_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_00805f9b34fb);
/// `FFF2` characteristic (write, host to adapter).
pub const FFF2_WRITE_UUID: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_00805f9b34fb);

// FFE0 layout (HM-10 style, one characteristic)
/// `FFE0` serial service.
pub const FFE0_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// `FFE1` characteristic (write and notify).
pub const FFE1_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID is a known adapter serial service.
pub fn is_adapter_service(uuid: &Uuid) -> bool {
    *uuid == ELM327_SERVICE_UUID || *uuid == FFF0_SERVICE_UUID || *uuid == FFE0_SERVICE_UUID
}

/// Write characteristic to pair with a notify characteristic.
///
/// The `FFF0` layout splits the link; every other layout writes to the
/// characteristic it subscribes to.
pub fn write_characteristic_for(notify: Uuid) -> Uuid {
    if notify == FFF1_NOTIFY_UUID {
        FFF2_WRITE_UUID
    } else {
        notify
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            ELM327_SERVICE_UUID.to_string(),
            "e7810a71-73ae-499d-8c15-faa9aef0c3f2"
        );
        assert_eq!(
            ELM327_CHARACTERISTIC_UUID.to_string(),
            "bef8d6c9-9c21-4c9e-b632-bd58c1009f9f"
        );
        assert!(FFF0_SERVICE_UUID.to_string().starts_with("0000fff0"));
    }

    #[test]
    fn test_is_adapter_service() {
        assert!(is_adapter_service(&ELM327_SERVICE_UUID));
        assert!(is_adapter_service(&FFE0_SERVICE_UUID));
        assert!(!is_adapter_service(&FFE1_CHARACTERISTIC_UUID));
    }

    #[test]
    fn test_write_characteristic_for() {
        assert_eq!(write_characteristic_for(FFF1_NOTIFY_UUID), FFF2_WRITE_UUID);
        assert_eq!(
            write_characteristic_for(ELM327_CHARACTERISTIC_UUID),
            ELM327_CHARACTERISTIC_UUID
        );
    }
}
