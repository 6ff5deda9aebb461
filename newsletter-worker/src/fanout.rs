//! Expansion of one feed item into per-subscriber delivery tasks.

use std::collections::HashSet;

use crate::model::{FeedItem, List, Subscription};
use crate::queue::DeliveryTask;

/// Build one task per verified subscriber of `list` for `item`.
///
/// `subscribers` is the snapshot taken once for this item. Unverified rows
/// and repeated addresses are dropped, so every (list, item, subscriber)
/// appears at most once. Order follows the snapshot.
pub fn fan_out(
    list: &List,
    item: &FeedItem,
    content_hash: &str,
    subscribers: &[Subscription],
) -> Vec<DeliveryTask> {
    let subject = subject_for(list, item);
    let mut seen = HashSet::new();

    subscribers
        .iter()
        .filter(|s| s.list == list.name && s.is_verified())
        .filter(|s| seen.insert(s.email.as_str()))
        .map(|s| DeliveryTask {
            list_name: list.name.clone(),
            subscriber_email: s.email.clone(),
            subject: subject.clone(),
            content_hash: content_hash.to_string(),
            item_guid: item.guid.clone(),
        })
        .collect()
}

/// Item title, or the list name for untitled items.
pub fn subject_for(list: &List, item: &FeedItem) -> String {
    let title = item.title.trim();
    if title.is_empty() {
        list.name.clone()
    } else {
        title.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Feed, VerificationState};
    use chrono::Utc;

    fn list() -> List {
        List {
            name: "news".to_string(),
            description: String::new(),
            domain: "news.example.com".to_string(),
            from_address: "news@example.com".to_string(),
            reply_to_address: "news@example.com".to_string(),
            feeds: vec![Feed::new("https://example.com/feed.xml")],
        }
    }

    fn item(title: &str) -> FeedItem {
        FeedItem {
            guid: "g1".to_string(),
            title: title.to_string(),
            content: "<p>x</p>".to_string(),
            published_at: Some(Utc::now()),
        }
    }

    fn sub(list: &str, email: &str, verification: VerificationState) -> Subscription {
        Subscription {
            list: list.to_string(),
            email: email.to_string(),
            verification_token: format!("tok-{}", email),
            verification,
            last_sent_verification: Utc::now(),
        }
    }

    #[test]
    fn test_fan_out_one_task_per_verified_subscriber() {
        let subscribers = vec![
            sub("news", "a@example.com", VerificationState::Verified),
            sub("news", "b@example.com", VerificationState::Unverified),
            sub("news", "c@example.com", VerificationState::Verified),
            sub("news", "a@example.com", VerificationState::Verified),
            sub("other", "d@example.com", VerificationState::Verified),
        ];

        let tasks = fan_out(&list(), &item("Issue 1"), "hash", &subscribers);

        let emails: Vec<_> = tasks.iter().map(|t| t.subscriber_email.as_str()).collect();
        assert_eq!(emails, vec!["a@example.com", "c@example.com"]);
        for task in &tasks {
            assert_eq!(task.list_name, "news");
            assert_eq!(task.subject, "Issue 1");
            assert_eq!(task.content_hash, "hash");
            assert_eq!(task.item_guid, "g1");
        }
    }

    #[test]
    fn test_fan_out_dedup_keys_are_unique_within_group() {
        let subscribers = vec![
            sub("news", "a@example.com", VerificationState::Verified),
            sub("news", "b@example.com", VerificationState::Verified),
        ];

        let tasks = fan_out(&list(), &item("Issue 1"), "hash", &subscribers);

        let keys: HashSet<_> = tasks.iter().map(|t| t.dedup_key()).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.group == "news:g1"));
    }

    #[test]
    fn test_fan_out_empty_snapshot() {
        assert!(fan_out(&list(), &item("Issue 1"), "hash", &[]).is_empty());
    }

    #[test]
    fn test_subject_falls_back_to_list_name() {
        assert_eq!(subject_for(&list(), &item("  ")), "news");
    }
}
