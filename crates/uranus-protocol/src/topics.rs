/// Broker topic names for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    agent_id: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Inbound commands addressed to this agent.
    pub fn command(&self) -> String {
        format!("{}/command/{}", self.prefix, self.agent_id)
    }

    /// Responses and terminal output produced by this agent.
    pub fn response(&self) -> String {
        format!("{}/response/{}", self.prefix, self.agent_id)
    }

    pub fn heartbeat(&self) -> String {
        format!("{}/heartbeat", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }
}

/// MQTT-style topic filter match supporting `+` and trailing `#`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
