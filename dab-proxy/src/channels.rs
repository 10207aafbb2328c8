//! DAB Band III channel plan.
//!
//! One channel carries one ensemble. The sweep order below covers the
//! regular Band III grid; the `N` channels (10N/11N/12N) sit between
//! regular slots and are accepted for tuning but skipped during scans.

/// Channels visited by a scan, in sweep order.
pub const SCAN_CHANNELS: [&str; 38] = [
    "5A", "5B", "5C", "5D",
    "6A", "6B", "6C", "6D",
    "7A", "7B", "7C", "7D",
    "8A", "8B", "8C", "8D",
    "9A", "9B", "9C", "9D",
    "10A", "10B", "10C", "10D",
    "11A", "11B", "11C", "11D",
    "12A", "12B", "12C", "12D",
    "13A", "13B", "13C", "13D", "13E", "13F",
];

/// Intermediate channels valid for tuning but not part of the sweep.
const EXTRA_CHANNELS: [&str; 3] = ["10N", "11N", "12N"];

/// Highest device index accepted by the API.
pub const MAX_DEVICE_INDEX: u32 = 15;

/// Check whether a channel name belongs to the Band III plan.
pub fn is_valid_channel(channel: &str) -> bool {
    SCAN_CHANNELS.contains(&channel) || EXTRA_CHANNELS.contains(&channel)
}

/// Check a tuner gain value: -1 selects AGC, 0..=49 is manual gain in dB.
pub fn is_valid_gain(gain: i32) -> bool {
    (-1..=49).contains(&gain)
}

/// Check a device index against the supported range.
pub fn is_valid_device_index(index: u32) -> bool {
    index <= MAX_DEVICE_INDEX
}
