#![no_main]
use autoscaler_core::persist::{parse_tuner_status, PersistedTunerStatus};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(raw) = serde_json::from_str::<PersistedTunerStatus>(s) {
            let _ = parse_tuner_status(&raw);
        }
    }
});
