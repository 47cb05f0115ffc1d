use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device information reported by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub platform: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub pixel_ratio: f64,
    pub touch_support: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone_offset: Option<i32>,
}

impl DeviceInfo {
    /// Whether the reported user agent looks like a mobile device
    pub fn is_mobile(&self) -> bool {
        let ua = self.user_agent.to_lowercase();
        ["mobile", "android", "iphone", "ipad"]
            .iter()
            .any(|kw| ua.contains(kw))
    }
}

/// A live application session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Sticky upstream egress token assigned to this session, if bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    /// Free-form client metadata
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Bounded navigation history, oldest evicted first
    pub history: VecDeque<String>,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub client_addr: Option<String>,
}

impl Session {
    pub fn new(id: String, client_addr: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            upstream_token: None,
            device_info: None,
            metadata: HashMap::new(),
            history: VecDeque::new(),
            is_active: true,
            client_addr,
        }
    }

    /// Update the last-activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Append a URL to the navigation history, evicting the oldest entry
    /// once the limit is reached
    pub fn push_history(&mut self, url: String, limit: usize) {
        self.history.push_back(url);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Seconds since the last recorded activity
    pub fn idle_seconds(&self) -> i64 {
        (Utc::now() - self.last_activity).num_seconds()
    }

    /// Whether this session should be served with a mobile profile
    pub fn prefers_mobile(&self) -> bool {
        if let Some(flag) = self.metadata.get("is_mobile") {
            return flag == "true";
        }
        self.device_info
            .as_ref()
            .map(|device| device.is_mobile())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut session = Session::new("s1".to_string(), None);
        for i in 0..5 {
            session.push_history(format!("https://example.test/{}", i), 3);
        }

        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history[0], "https://example.test/2");
        assert_eq!(session.history[2], "https://example.test/4");
    }

    #[test]
    fn test_touch_advances_activity() {
        let mut session = Session::new("s1".to_string(), None);
        let before = session.last_activity;
        session.touch();
        assert!(session.last_activity >= before);
        assert!(session.idle_seconds() <= 1);
    }

    #[test]
    fn test_device_info_mobile_detection() {
        let desktop = DeviceInfo {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string(),
            ..Default::default()
        };
        assert!(!desktop.is_mobile());

        let phone = DeviceInfo {
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X)".to_string(),
            ..Default::default()
        };
        assert!(phone.is_mobile());
    }

    #[test]
    fn test_device_info_deserializes_partial_payload() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"userAgent":"test-agent","screenWidth":390,"screenHeight":844}"#,
        )
        .unwrap();

        assert_eq!(info.user_agent, "test-agent");
        assert_eq!(info.screen_width, 390);
        assert!(info.device_memory.is_none());
    }
}
