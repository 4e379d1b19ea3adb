// Broker connect attempts per cycle before the node halts
pub const MQTT_CONNECT_ATTEMPTS: u8 = 3;
// Pause between two broker connect attempts [ms]
pub const MQTT_RETRY_DELAY_MS: u32 = 5000;
// Time the broker gets to acknowledge a connect [ms]
pub const MQTT_CONNECT_TIMEOUT_MS: u32 = 10_000;
// Feed topics are "{user}/feeds/{prefix}-{metric}"
pub const MQTT_MAX_TOPIC_LEN: usize = 64;

// Interval for polling the association status [ms]
pub const WIFI_POLL_INTERVAL_MS: u32 = 500;
// Default upper bound for the association wait [sec]
pub const WIFI_ASSOCIATION_TIMEOUT_SECS: u64 = 30;

// Interval for polling the override switch while it is held [ms]
pub const OVERRIDE_POLL_INTERVAL_MS: u32 = 1500;

// Deep sleep duration bounds [min]
pub const SLEEP_MINUTES_MIN: u32 = 1;
pub const SLEEP_MINUTES_MAX: u32 = 180;

// Task watchdog timeout, must exceed the longest single blocking step [sec]
pub const WATCHDOG_TIMEOUT_SECS: u32 = 60;

// How long the provisioning portal waits for a submitted configuration [sec]
pub const PROVISIONING_WINDOW_SECS: u32 = 180;

// Process exit code signalling fail-stop to a supervisor on hosts
// without a hardware watchdog
pub const FAIL_STOP_EXIT_CODE: i32 = 3;
