//! Process-wide tracing install. Lives in its own test binary so the global
//! subscriber cannot collide with `#[traced_test]` in the library tests.

use warden_core::observability::init_tracing;
use warden_core::types::ObservabilityConfig;

#[test]
fn init_tracing_is_idempotent() {
    let config = ObservabilityConfig {
        log_ring_capacity: 8,
        ..ObservabilityConfig::default()
    };
    let first = init_tracing(&config);
    let second = init_tracing(&ObservabilityConfig::default());

    tracing::error!(check = 1, "ring_shared_between_readers");

    let records = first.records();
    assert_eq!(records.len(), second.len());
    let last = records.last().expect("ring captured the event");
    assert_eq!(last.message, "ring_shared_between_readers");
    assert_eq!(last.level, "ERROR");
    assert_eq!(last.fields, "check=1");
}
