//! Built-in metric names and bucketing rules.

/// Open-app events per hour of day (slot "0".."23").
pub const OPEN_APP_TIME_DISTRIBUTION: &str = "OpenAppTimeDistributionSlotCounter";
/// Devices per daily open-count bucket.
pub const OPEN_APP_COUNT_DISTRIBUTION: &str = "OpenAppCountDistributionSlotCounter";
/// Open-app events per channel/platform/version.
pub const OPEN_APP_CPV: &str = "OpenAppCPVCounter";
/// First sightings of a device per hour of day.
pub const NEW_USER_TIME_DISTRIBUTION: &str = "NewUserTimeDistributionSlotCounter";
/// First sightings of a user id.
pub const NEW_REGISTERED_USER_CPV: &str = "NewRegisteredUserCPVCounter";
/// First sightings of a device.
pub const NEW_USER_CPV: &str = "NewUserCPVCounter";
/// Distinct devices opening the app per day.
pub const DAILY_ACTIVE_CPV: &str = "DailyActiveCPVCounter";

/// New-user cohort retention, dated at the cohort's creation date.
pub const NEW_USER_RETENTION: &str = "NewUserRetentionSlotCounter";
const CHANNEL_NEW_USER_RETENTION_PREFIX: &str = "channelNewUserRetentionSlotCounter_";

/// Active-user retention, dated at the day being confirmed retained.
pub const ACTIVE_USER_RETENTION: &str = "ActiveUserRetentionSlotCounter";
const CHANNEL_ACTIVE_USER_RETENTION_PREFIX: &str = "channelActiveUserRetentionSlotCounter_";
/// First opens of the day per hour of day.
pub const ACTIVE_USER_TIME_DISTRIBUTION: &str = "ActiveUserTimeDistributionSlotCounter";

pub const DAILY_ACTIVE_NEW_USER_PERCENT: &str = "DailyActiveNewUserPercentSimpleCounter";
pub const DAILY_ACTIVE_USER_AFFINITY: &str = "DailyActiveUserAffinitySlotCounter";
pub const DAILY_ACTIVE_USER_FRESHNESS: &str = "DailyActiveUserFreshnessSlotCounter";

/// Usage reports per day.
pub const USAGE_COUNT: &str = "UsageSimpleCounter";
/// Reported usage seconds per day.
pub const USAGE_TIME_TOTAL: &str = "UsageTimeTotalSimpleCounter";
pub const EACH_USAGE_TIME_DISTRIBUTION: &str = "EachUsageTimeDistributionSlotCounter";
pub const EACH_USAGE_AVERAGE_TIME: &str = "EachUsageAverageTimeSimpleCounter";
pub const DAILY_USAGE_TIME_DISTRIBUTION: &str = "DailyUsageTimeDistributionSlotCounter";
pub const DAILY_USAGE_AVERAGE_TIME: &str = "DailyUsageAverageTimeSimpleCounter";

/// Day offsets tracked by both retention counters.
pub const RETENTION_HORIZONS: [i64; 9] = [1, 2, 3, 4, 5, 6, 7, 15, 30];

/// Freshness slot for devices older than the longest horizon.
pub const FRESHNESS_CLAMP: i64 = 31;

/// Trailing windows of the affinity ratios, in days.
pub const AFFINITY_WINDOWS: [i64; 3] = [7, 15, 30];

/// Usage reports shorter than this are noise.
pub const MIN_USAGE_SECONDS: f64 = 0.1;

/// Per-channel variant of the new-user retention counter.
pub fn channel_new_user_retention(channel: &str) -> String {
    format!("{CHANNEL_NEW_USER_RETENTION_PREFIX}{channel}")
}

/// Per-channel variant of the active-user retention counter.
pub fn channel_active_user_retention(channel: &str) -> String {
    format!("{CHANNEL_ACTIVE_USER_RETENTION_PREFIX}{channel}")
}

/// Usage-time buckets in ascending order; upper bounds are inclusive.
pub const USAGE_TIME_SLOTS: [&str; 8] =
    ["1-3", "4-10", "11-30", "31-60", "61-180", "181-600", "601-1800", "1800+"];

/// Open-count buckets in ascending order; upper bounds are inclusive.
pub const OPEN_COUNT_SLOTS: [&str; 9] =
    ["1-2", "3-4", "5-6", "7-8", "9-10", "11-20", "21-30", "31-49", "50+"];

/// Bucket for a usage duration. `"4-10"` covers `(3, 10]`.
pub fn usage_time_slot(seconds: f64) -> &'static str {
    const UPPER: [f64; 7] = [3.0, 10.0, 30.0, 60.0, 180.0, 600.0, 1800.0];
    let index = UPPER.iter().position(|bound| seconds <= *bound).unwrap_or(UPPER.len());
    USAGE_TIME_SLOTS[index]
}

/// Bucket for a per-device daily open count.
pub fn open_count_slot(count: u64) -> &'static str {
    const UPPER: [u64; 8] = [2, 4, 6, 8, 10, 20, 30, 49];
    let index = UPPER.iter().position(|bound| count <= *bound).unwrap_or(UPPER.len());
    OPEN_COUNT_SLOTS[index]
}
