//! Topic scheme and wildcard matching.
//!
//! Every address used on the broker is produced here, so the exact layout
//! lives in one place and stays compatible with peers that speak the same
//! scheme:
//!
//! ```text
//! Purpose                  | Topic
//! -------------------------|--------------------------------------------------
//! Event publish            | {sys}/event/{appName}/{eventName}
//! Event subscribe          | {sys}/event/{appName}/{eventKey}
//! Event subscribe (queued) | $queue/{sys}/event/{appName}/{eventKey}
//! RPC request              | {sys}/{app}/rpc/server/{action}
//! RPC response             | {sys}/{callerApp}/rpc/client/{callerAppId}/{callId}
//! Config entry (retained)  | {sys}/synapse-config-store/{key}
//! ```
//!
//! Subscription filters use the broker's wildcard syntax: `+` matches exactly
//! one path segment, `#` matches any remaining segments. The `$queue/` prefix
//! turns a subscription into a shared (competing-consumer) subscription where
//! each message is delivered to exactly one member of the group.

/// Topic segment reserved for the shared configuration store.
pub(crate) const CONFIG_STORE_SEGMENT: &str = "synapse-config-store";

/// Prefix that marks a subscription as shared (competing consumers).
pub(crate) const SHARED_PREFIX: &str = "$queue/";

/// Precomputed topic addresses for one application instance.
///
/// Built once at connect time from `{sys_name, app_name, app_id}` and never
/// changed afterwards; the inbound dispatcher routes on the prefixes exposed
/// here.
#[derive(Debug, Clone)]
pub(crate) struct TopicScheme {
    sys: String,
    app: String,
    event_prefix: String,
    rpc_server_prefix: String,
    rpc_reply_prefix: String,
    config_prefix: String,
}

impl TopicScheme {
    pub(crate) fn new(sys: &str, app: &str, app_id: &str) -> Self {
        Self {
            sys: sys.to_string(),
            app: app.to_string(),
            event_prefix: format!("{sys}/event/{app}/"),
            rpc_server_prefix: format!("{sys}/{app}/rpc/server/"),
            rpc_reply_prefix: format!("{sys}/{app}/rpc/client/{app_id}/"),
            config_prefix: format!("{sys}/{CONFIG_STORE_SEGMENT}/"),
        }
    }

    /// Topic an event of this application is published to.
    pub(crate) fn event_publish(&self, event_name: &str) -> String {
        format!("{}{}", self.event_prefix, event_name)
    }

    /// Subscription filter for one registered event key.
    pub(crate) fn event_subscription(&self, key: &str, load_balanced: bool) -> String {
        let topic = format!("{}{}", self.event_prefix, key);
        if load_balanced {
            format!("{SHARED_PREFIX}{topic}")
        } else {
            topic
        }
    }

    /// Request topic for an action exposed by `app`.
    pub(crate) fn rpc_request(&self, app: &str, action: &str) -> String {
        format!("{}/{}/rpc/server/{}", self.sys, app, action)
    }

    /// Private reply topic of a specific caller instance and call.
    pub(crate) fn rpc_reply(&self, caller_app: &str, caller_app_id: &str, call_id: &str) -> String {
        format!(
            "{}/{}/rpc/client/{}/{}",
            self.sys, caller_app, caller_app_id, call_id
        )
    }

    /// Shared subscription covering every action addressed to this application.
    pub(crate) fn rpc_server_subscription(&self) -> String {
        format!("{SHARED_PREFIX}{}+", self.rpc_server_prefix)
    }

    /// Subscription covering every reply addressed to this instance.
    pub(crate) fn rpc_reply_subscription(&self) -> String {
        format!("{}+", self.rpc_reply_prefix)
    }

    /// Retained topic holding one configuration entry.
    pub(crate) fn config_entry(&self, key: &str) -> String {
        format!("{}{}", self.config_prefix, key)
    }

    /// Subscription covering the whole configuration store.
    pub(crate) fn config_subscription(&self) -> String {
        format!("{}#", self.config_prefix)
    }

    pub(crate) fn event_prefix(&self) -> &str {
        &self.event_prefix
    }

    pub(crate) fn rpc_server_prefix(&self) -> &str {
        &self.rpc_server_prefix
    }

    pub(crate) fn rpc_reply_prefix(&self) -> &str {
        &self.rpc_reply_prefix
    }

    pub(crate) fn config_prefix(&self) -> &str {
        &self.config_prefix
    }
}

/// Check whether a topic matches a subscription filter.
///
/// `+` matches exactly one segment, `#` matches all remaining segments
/// (including none). Everything else is a literal segment comparison.
///
/// ```ignore
/// assert!(topic_matches("a/+/c", "a/b/c"));
/// assert!(!topic_matches("a/+/c", "a/b/b/c"));
/// assert!(topic_matches("a/#", "a/b/c"));
/// ```
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> TopicScheme {
        TopicScheme::new("testsys", "myapp", "instance-1")
    }

    // Matcher tests

    #[test]
    fn test_matches_exact() {
        assert!(topic_matches("user/created", "user/created"));
        assert!(!topic_matches("user/created", "user/updated"));
        assert!(!topic_matches("user/created", "user/created/extra"));
        assert!(!topic_matches("user/created/extra", "user/created"));
    }

    #[test]
    fn test_matches_single_segment_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/b/c"));
        assert!(!topic_matches("a/+/c", "a/c"));
        assert!(topic_matches("+", "anything"));
        assert!(!topic_matches("+", "two/segments"));
    }

    #[test]
    fn test_matches_multi_segment_wildcard() {
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/#", "a/b"));
        assert!(topic_matches("a/#", "a"));
        assert!(!topic_matches("a/#", "b/a"));
        assert!(topic_matches("#", "any/depth/at/all"));
    }

    #[test]
    fn test_matches_combined_wildcards() {
        assert!(topic_matches("a/+/c/#", "a/b/c/d/e"));
        assert!(!topic_matches("a/+/c/#", "a/b/d"));
    }

    // Scheme tests: the literal layout is wire-compatible with peers,
    // so every address is asserted verbatim.

    #[test]
    fn test_event_topics() {
        let s = scheme();
        assert_eq!(
            s.event_publish("user/created"),
            "testsys/event/myapp/user/created"
        );
        assert_eq!(
            s.event_subscription("user/+", false),
            "testsys/event/myapp/user/+"
        );
        assert_eq!(
            s.event_subscription("user/+", true),
            "$queue/testsys/event/myapp/user/+"
        );
    }

    #[test]
    fn test_rpc_topics() {
        let s = scheme();
        assert_eq!(
            s.rpc_request("billing", "Invoices.Create"),
            "testsys/billing/rpc/server/Invoices.Create"
        );
        assert_eq!(
            s.rpc_reply("caller", "caller-7", "call-42"),
            "testsys/caller/rpc/client/caller-7/call-42"
        );
        assert_eq!(
            s.rpc_server_subscription(),
            "$queue/testsys/myapp/rpc/server/+"
        );
        assert_eq!(
            s.rpc_reply_subscription(),
            "testsys/myapp/rpc/client/instance-1/+"
        );
    }

    #[test]
    fn test_config_topics() {
        let s = scheme();
        assert_eq!(
            s.config_entry("feature/flags"),
            "testsys/synapse-config-store/feature/flags"
        );
        assert_eq!(s.config_subscription(), "testsys/synapse-config-store/#");
    }

    #[test]
    fn test_prefixes_route_inbound_topics() {
        let s = scheme();
        let topic = s.event_publish("order/paid");
        assert_eq!(topic.strip_prefix(s.event_prefix()), Some("order/paid"));

        let topic = s.rpc_request("myapp", "Orders.Get");
        assert_eq!(topic.strip_prefix(s.rpc_server_prefix()), Some("Orders.Get"));

        let topic = s.rpc_reply("myapp", "instance-1", "call-1");
        assert_eq!(topic.strip_prefix(s.rpc_reply_prefix()), Some("call-1"));

        let topic = s.config_entry("db/url");
        assert_eq!(topic.strip_prefix(s.config_prefix()), Some("db/url"));
    }
}
