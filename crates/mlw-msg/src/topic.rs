//! ---
//! mlw_section: "02-messaging-data-model"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Message classification, extraction and result assembly."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::{MessagingError, Result};

const TRIGGER_ROOT: [&str; 2] = ["kosmos", "analytics"];

/// Model identity addressed by a trigger topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerTopic {
    /// Model url segment.
    pub model: String,
    /// Model tag segment.
    pub tag: String,
}

/// Parse `[/]kosmos/analytics/<model>/<tag>[/]`.
pub fn parse_topic(topic: &str) -> Result<TriggerTopic> {
    let inner = topic.strip_prefix('/').unwrap_or(topic);
    let inner = inner.strip_suffix('/').unwrap_or(inner);
    let segments: Vec<&str> = inner.split('/').collect();
    match segments.as_slice() {
        [root, analytics, model, tag]
            if [*root, *analytics] == TRIGGER_ROOT && !model.is_empty() && !tag.is_empty() =>
        {
            Ok(TriggerTopic {
                model: (*model).to_owned(),
                tag: (*tag).to_owned(),
            })
        }
        _ => Err(MessagingError::InvalidTopic(topic.to_owned())),
    }
}

/// Join a base topic and a routing key, appending the temporary keyword
/// when requested. Repeated slashes collapse to one.
pub fn render_topic(
    base: &str,
    routing_key: &str,
    temporary: bool,
    temporary_keyword: &str,
) -> String {
    let mut topic = format!("{}/{}", base, routing_key);
    if temporary {
        topic.push('/');
        topic.push_str(temporary_keyword);
    }
    while topic.contains("//") {
        topic = topic.replace("//", "/");
    }
    topic
}

/// Whether `topic` is `<base>/<routing key>[/..]` with a non-empty key.
/// Leading and trailing slashes of `base` are ignored.
pub fn is_result_topic(topic: &str, base: &str) -> bool {
    let topic = topic.trim_start_matches('/');
    let base = base.trim_matches('/');
    let rest = if base.is_empty() {
        Some(topic)
    } else {
        topic
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
    };
    rest.and_then(|rest| rest.split('/').next())
        .is_some_and(|segment| !segment.is_empty())
}
