use proptest::prelude::*;
use tessera_core::ProvisioningConfig;
use tessera_identity::{
    crypto, DeviceIdentity, IdentityError, LogicalDeviceSlot, SimulatedTpm, MAX_LOGICAL_DEVICE,
};

fn device() -> DeviceIdentity {
    tessera_core::logging::try_init();
    DeviceIdentity::initialize(Box::new(SimulatedTpm::new()), &ProvisioningConfig::default())
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn out_of_range_slots_are_rejected_without_effect(slot in MAX_LOGICAL_DEVICE..usize::MAX) {
        let device = device();
        device.keys().create_hmac_key(0, b"keep").unwrap();

        let out_of_range = |result: Result<(), IdentityError>| {
            matches!(result, Err(IdentityError::SlotOutOfRange { .. }))
        };
        prop_assert!(out_of_range(device.keys().create_hmac_key(slot, b"k").map(|_| ())));
        prop_assert!(out_of_range(device.evict_slot(slot)));
        prop_assert!(out_of_range(device.service_uri().store(slot, "h/d").map(|_| ())));
        prop_assert!(out_of_range(device.is_provisioned(slot).map(|_| ())));
        prop_assert!(out_of_range(device.keys().sign_with_hmac_key(slot, b"d").map(|_| ())));
        prop_assert!(out_of_range(
            device.keys().create_or_import_identity_key(slot, "ECDSA").map(|_| ())
        ));

        // in-range state is unchanged
        prop_assert!(device.is_provisioned(0).unwrap());
        for other in 1..MAX_LOGICAL_DEVICE {
            prop_assert!(!device.is_provisioned(other).unwrap());
        }
    }

    #[test]
    fn slot_addresses_are_distinct(a in 0..MAX_LOGICAL_DEVICE, b in 0..MAX_LOGICAL_DEVICE) {
        let (sa, sb) = (LogicalDeviceSlot::new(a).unwrap(), LogicalDeviceSlot::new(b).unwrap());
        prop_assert_eq!(a == b, sa.hmac_key_handle() == sb.hmac_key_handle());
        prop_assert_eq!(a == b, sa.identity_key_handle() == sb.identity_key_handle());
        prop_assert_eq!(a == b, sa.uri_nv_index() == sb.uri_nv_index());
        prop_assert_eq!(a == b, sa.cert_nv_index() == sb.cert_nv_index());
        prop_assert_ne!(sa.hmac_key_handle(), sb.identity_key_handle());
    }

    #[test]
    fn hmac_is_deterministic_and_matches_software(
        key in prop::collection::vec(any::<u8>(), 1..=64),
        data in prop::collection::vec(any::<u8>(), 0..256),
        flip in any::<usize>(),
    ) {
        let device = device();
        device.keys().create_hmac_key(3, &key).unwrap();

        let first = device.keys().sign_with_hmac_key(3, &data).unwrap();
        let second = device.keys().sign_with_hmac_key(3, &data).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(first, crypto::hmac_sha256(&key, &[data.as_slice()]));

        let mut changed = data.clone();
        if changed.is_empty() {
            changed.push(0);
        } else {
            let at = flip % changed.len();
            changed[at] ^= 0x01;
        }
        prop_assert_ne!(first, device.keys().sign_with_hmac_key(3, &changed).unwrap());
    }

    #[test]
    fn service_uri_roundtrips(uri in "[a-z0-9.-]{1,40}/[A-Za-z0-9_-]{1,40}") {
        let device = device();
        device.service_uri().store(4, &uri).unwrap();
        prop_assert_eq!(device.service_uri().read(4).unwrap(), uri);
    }
}
