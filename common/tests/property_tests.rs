//! Property tests for the persisted record and the in-place decoders.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use proptest::prelude::*;
use wifiplug_common::{
    store::{Eeprom, MemoryEeprom, SettingsStore, SEALED_LEN},
    web::{base64_decode_in_place, url_decode_in_place, ProtocolError},
    Action, DayMask, Event, Settings,
};

fn arb_event() -> impl Strategy<Value = Event> {
    (0u8..0x80, 0u8..24, 0u8..60, 0u8..6).prop_map(|(days, hour, minute, action)| Event {
        days: DayMask::from_bits(days),
        hour,
        minute,
        action: Action::from_u8(action).unwrap_or_default(),
    })
}

fn arb_settings() -> impl Strategy<Value = Settings> {
    (
        "[a-zA-Z0-9 ]{0,31}",
        "[a-z.]{0,47}",
        any::<u16>(),
        any::<bool>(),
        proptest::collection::vec(arb_event(), 24),
    )
        .prop_map(|(ssid, host, port, power_fail, events)| {
            let mut settings = Settings::default();
            settings.network.ssid = ssid;
            settings.mqtt.host = host;
            settings.mqtt.port = port;
            settings.events.on_after_power_fail = power_fail;
            settings.events.events.copy_from_slice(&events);
            settings
        })
}

proptest! {
    #[test]
    fn saved_records_load_back_identically(settings in arb_settings()) {
        let mut store = SettingsStore::new(MemoryEeprom::default());
        store.save(&settings).unwrap();

        let (loaded, ok) = store.load(false);
        prop_assert!(ok);
        prop_assert_eq!(loaded, settings);
    }

    /// Any single-byte change inside the record or its trailer is caught.
    #[test]
    fn corrupted_byte_falls_back_to_defaults(
        settings in arb_settings(),
        offset in 0..SEALED_LEN,
        flip in 1u8..=255,
    ) {
        let mut store = SettingsStore::new(MemoryEeprom::default());
        store.save(&settings).unwrap();

        let device = store.device_mut();
        device.begin(0).unwrap();
        let mut byte = [0u8];
        device.read(offset, &mut byte).unwrap();
        byte[0] ^= flip;
        device.write(offset, &byte).unwrap();
        device.end();

        let (loaded, ok) = store.load(false);
        prop_assert!(!ok);
        prop_assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn base64_round_trips_whole_groups(data in proptest::collection::vec(any::<u8>(), 0..32)) {
        let len = data.len() - data.len() % 3;
        let data = &data[..len];
        let mut buf = STANDARD.encode(data).into_bytes();

        let decoded = base64_decode_in_place(&mut buf).unwrap();
        prop_assert_eq!(&buf[..decoded], data);
    }

    #[test]
    fn base64_padded_input_round_trips(data in proptest::collection::vec(any::<u8>(), 1..32)) {
        let mut buf = STANDARD.encode(&data).into_bytes();
        let decoded = base64_decode_in_place(&mut buf).unwrap();
        prop_assert_eq!(&buf[..decoded], &data[..]);
    }

    #[test]
    fn base64_rejects_partial_groups(data in proptest::collection::vec(any::<u8>(), 1..32), cut in 1usize..4) {
        let mut encoded = STANDARD.encode(&data).into_bytes();
        encoded.truncate(encoded.len() - cut);
        prop_assert!(matches!(
            base64_decode_in_place(&mut encoded),
            Err(ProtocolError::MalformedEncoding)
        ));
    }

    #[test]
    fn url_decode_leaves_clean_input_alone(input in "[a-zA-Z0-9=&/._-]{0,64}") {
        let mut buf = input.clone().into_bytes();
        let len = url_decode_in_place(&mut buf);
        prop_assert_eq!(&buf[..len], input.as_bytes());
    }
}
