//! Multicast groups
//!
//! A group is a named fan-out list of pattern-filtered subscribers.
//! Groups are created lazily on first subscribe and deleted when the
//! subscriber list empties. A subscription filter is either a verbatim
//! prefix of the message name, or — with the `re:` marker — a precompiled
//! regular expression; an empty filter matches everything.

use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Compiled subscription filter
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Empty filter: every message name matches
    All,
    /// Verbatim prefix match
    Prefix(String),
    /// `re:`-prefixed filters compile to a regex
    Regex(Regex),
}

impl Pattern {
    pub fn compile(filter: &str) -> Result<Pattern, regex::Error> {
        if filter.is_empty() {
            Ok(Pattern::All)
        } else if let Some(expr) = filter.strip_prefix("re:") {
            Ok(Pattern::Regex(Regex::new(expr)?))
        } else {
            Ok(Pattern::Prefix(filter.to_string()))
        }
    }

    pub fn matches(&self, message_name: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Prefix(prefix) => message_name.starts_with(prefix.as_str()),
            Pattern::Regex(regex) => regex.is_match(message_name),
        }
    }
}

#[derive(Debug)]
struct Subscription {
    subscriber: String,
    /// Original filter text, used as the dedup/removal key
    filter: String,
    pattern: Pattern,
}

/// Registry of every multicast group in the daemon
#[derive(Default)]
pub struct GroupRegistry {
    groups: HashMap<String, Vec<Subscription>>,
}

impl GroupRegistry {
    pub fn new() -> GroupRegistry {
        GroupRegistry::default()
    }

    /// Add a subscription; the group is created on first subscribe.
    /// Re-subscribing with the same filter is a no-op.
    pub fn subscribe(
        &mut self,
        group: &str,
        subscriber: &str,
        filter: &str,
    ) -> Result<(), regex::Error> {
        let pattern = Pattern::compile(filter)?;
        let subscriptions = self.groups.entry(group.to_string()).or_default();
        if subscriptions
            .iter()
            .any(|s| s.subscriber == subscriber && s.filter == filter)
        {
            return Ok(());
        }
        debug!(group, subscriber, filter, "subscription added");
        subscriptions.push(Subscription {
            subscriber: subscriber.to_string(),
            filter: filter.to_string(),
            pattern,
        });
        Ok(())
    }

    /// Remove one subscription (`filter` given) or all of a subscriber's
    /// subscriptions (`filter` None). A group whose subscriber list
    /// empties is deleted.
    pub fn unsubscribe(&mut self, group: &str, subscriber: &str, filter: Option<&str>) {
        if let Some(subscriptions) = self.groups.get_mut(group) {
            subscriptions.retain(|s| {
                s.subscriber != subscriber || filter.is_some_and(|f| f != s.filter)
            });
            if subscriptions.is_empty() {
                debug!(group, "last subscriber left, deleting group");
                self.groups.remove(group);
            }
        }
    }

    /// Drop every subscription held by `subscriber` (actor death)
    pub fn remove_subscriber(&mut self, subscriber: &str) {
        self.groups
            .retain(|group, subscriptions| {
                subscriptions.retain(|s| s.subscriber != subscriber);
                if subscriptions.is_empty() {
                    debug!(group, "last subscriber left, deleting group");
                    false
                } else {
                    true
                }
            });
    }

    /// Subscribers of `group` whose filter matches `message_name`, in
    /// subscription order
    pub fn matching_subscribers(&self, group: &str, message_name: &str) -> Vec<&str> {
        self.groups
            .get(group)
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .filter(|s| s.pattern.matches(message_name))
                    .map(|s| s.subscriber.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns() {
        assert!(Pattern::compile("").unwrap().matches("anything"));
        let prefix = Pattern::compile("job-").unwrap();
        assert!(prefix.matches("job-done"));
        assert!(!prefix.matches("task-done"));
        let regex = Pattern::compile("re:^job-(start|done)$").unwrap();
        assert!(regex.matches("job-done"));
        assert!(!regex.matches("job-failed"));
        assert!(Pattern::compile("re:(unclosed").is_err());
    }

    #[test]
    fn lazy_creation_and_deletion() {
        let mut groups = GroupRegistry::new();
        assert!(!groups.contains("metrics@local"));

        groups.subscribe("metrics@local", "a@local", "").unwrap();
        groups.subscribe("metrics@local", "b@local", "job-").unwrap();
        assert!(groups.contains("metrics@local"));

        groups.unsubscribe("metrics@local", "a@local", None);
        assert!(groups.contains("metrics@local"));
        groups.unsubscribe("metrics@local", "b@local", Some("job-"));
        // Deleting the last subscriber removes the group itself
        assert!(!groups.contains("metrics@local"));
    }

    #[test]
    fn duplicate_subscription_is_a_noop() {
        let mut groups = GroupRegistry::new();
        groups.subscribe("g@local", "a@local", "x-").unwrap();
        groups.subscribe("g@local", "a@local", "x-").unwrap();
        assert_eq!(groups.matching_subscribers("g@local", "x-1").len(), 1);
    }

    #[test]
    fn matching_respects_filters_and_order() {
        let mut groups = GroupRegistry::new();
        groups.subscribe("g@local", "all@local", "").unwrap();
        groups.subscribe("g@local", "jobs@local", "job-").unwrap();
        groups
            .subscribe("g@local", "picky@local", "re:^job-done$")
            .unwrap();

        assert_eq!(
            groups.matching_subscribers("g@local", "job-done"),
            vec!["all@local", "jobs@local", "picky@local"]
        );
        assert_eq!(
            groups.matching_subscribers("g@local", "job-start"),
            vec!["all@local", "jobs@local"]
        );
        assert_eq!(
            groups.matching_subscribers("g@local", "other"),
            vec!["all@local"]
        );
        // Unknown group: silently nobody
        assert!(groups.matching_subscribers("nope@local", "job-done").is_empty());
    }

    #[test]
    fn subscriber_death_cleans_every_group() {
        let mut groups = GroupRegistry::new();
        groups.subscribe("g1@local", "a@local", "").unwrap();
        groups.subscribe("g2@local", "a@local", "").unwrap();
        groups.subscribe("g2@local", "b@local", "").unwrap();

        groups.remove_subscriber("a@local");
        assert!(!groups.contains("g1@local"));
        assert_eq!(groups.matching_subscribers("g2@local", "x"), vec!["b@local"]);
    }
}
