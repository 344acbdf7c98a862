//! ClientHello emulation profiles.
//!
//! The registry works in terms of string labels so fingerprint health can be
//! persisted, diffed, and blacklisted across runs independently of library
//! versions. This table is the one place labels meet the emulation library;
//! a label without a mapping surfaces as a fingerprint-unsupported fault and
//! ends up in the persistent blacklist like any other unusable profile.

use wreq_util::Emulation;

/// Labels of every profile this build can emulate, in rotation order.
pub fn default_pool() -> Vec<String> {
    SUPPORTED.iter().map(|(label, _)| label.to_string()).collect()
}

/// Resolve a label to its emulation, if this build supports it.
pub fn emulation_for(label: &str) -> Option<Emulation> {
    SUPPORTED
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, e)| *e)
}

const SUPPORTED: &[(&str, Emulation)] = &[
    // Chrome
    ("chrome100", Emulation::Chrome100),
    ("chrome101", Emulation::Chrome101),
    ("chrome104", Emulation::Chrome104),
    ("chrome105", Emulation::Chrome105),
    ("chrome106", Emulation::Chrome106),
    ("chrome107", Emulation::Chrome107),
    ("chrome108", Emulation::Chrome108),
    ("chrome109", Emulation::Chrome109),
    ("chrome114", Emulation::Chrome114),
    ("chrome116", Emulation::Chrome116),
    ("chrome117", Emulation::Chrome117),
    ("chrome118", Emulation::Chrome118),
    ("chrome119", Emulation::Chrome119),
    ("chrome120", Emulation::Chrome120),
    // Firefox
    ("firefox109", Emulation::Firefox109),
    ("firefox117", Emulation::Firefox117),
    // Safari
    ("safari15_3", Emulation::Safari15_3),
    ("safari15_6_1", Emulation::Safari15_6_1),
    ("safari16", Emulation::Safari16),
    ("safari16_5", Emulation::Safari16_5),
    ("safari17_0", Emulation::Safari17_0),
    // Edge
    ("edge101", Emulation::Edge101),
    ("edge122", Emulation::Edge122),
    ("edge127", Emulation::Edge127),
];
