//! MQTT topic builders for the device API and AWS IoT shadows.
//!
//! Topic structure:
//! ```text
//! {prefix}/request/{name}
//! {prefix}/response/{name}
//! {prefix}/lastwill
//! $aws/things/{thing}/shadow/update
//! $aws/things/{thing}/shadow/name/{shadow}/update
//! $aws/things/{thing}/shadow/name/{shadow}/update/{accepted|rejected}
//! ```

pub const REQUEST: &str = "request";
pub const RESPONSE: &str = "response";
pub const LAST_WILL: &str = "lastwill";

// ─── Device API topics ───

pub fn request(prefix: &str, name: &str) -> String {
    format!("{prefix}/{REQUEST}/{name}")
}

pub fn response(prefix: &str, name: &str) -> String {
    format!("{prefix}/{RESPONSE}/{name}")
}

/// Subscribe to every API response addressed to this device.
pub fn response_filter(prefix: &str) -> String {
    format!("{prefix}/{RESPONSE}/#")
}

pub fn last_will(prefix: &str) -> String {
    format!("{prefix}/{LAST_WILL}")
}

// ─── Shadow topics ───

pub fn shadow_prefix(thing_name: &str) -> String {
    format!("$aws/things/{thing_name}/shadow")
}

/// Update topic for a named shadow, or the classic shadow when `shadow_name` is empty.
pub fn shadow_update(thing_name: &str, shadow_name: &str) -> String {
    let prefix = shadow_prefix(thing_name);
    if shadow_name.is_empty() {
        format!("{prefix}/update")
    } else {
        format!("{prefix}/name/{shadow_name}/update")
    }
}

/// Subscribe to the accepted/rejected results of shadow updates.
pub fn shadow_update_results(thing_name: &str, shadow_name: &str) -> String {
    format!("{}/#", shadow_update(thing_name, shadow_name))
}
