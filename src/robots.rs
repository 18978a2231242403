//! robots.txt parsing and a per-origin cache.
//!
//! Rules are grouped by user-agent; the most specific group whose token is
//! contained in our agent string applies, falling back to `*`. Within a group
//! the longest matching pattern wins and `Allow` wins ties. A robots.txt that
//! cannot be fetched or parsed allows everything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use url::Url;

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    /// Rules per user-agent token (lowercase).
    groups: HashMap<String, AgentRules>,
    /// Rules for `*`.
    default_rules: AgentRules,
    sitemaps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct AgentRules {
    disallow: Vec<String>,
    allow: Vec<String>,
    crawl_delay: Option<f64>,
}

impl RobotsTxt {
    /// An empty rule set: everything allowed.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Self {
        let mut robots = Self::default();
        let mut current_agents: Vec<String> = Vec::new();
        let mut current_rules = AgentRules::default();
        let mut seen_rule = false;

        for line in content.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    // A user-agent line after rules starts a new group.
                    if seen_rule {
                        robots.commit(&current_agents, &current_rules);
                        current_agents.clear();
                        current_rules = AgentRules::default();
                        seen_rule = false;
                    }
                    current_agents.push(value.to_ascii_lowercase());
                }
                "disallow" => {
                    seen_rule = true;
                    if !value.is_empty() {
                        current_rules.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    seen_rule = true;
                    if !value.is_empty() {
                        current_rules.allow.push(value.to_string());
                    }
                }
                "crawl-delay" => {
                    seen_rule = true;
                    if let Ok(delay) = value.parse::<f64>() {
                        if delay.is_finite() && delay >= 0.0 {
                            current_rules.crawl_delay = Some(delay);
                        }
                    }
                }
                "sitemap" => robots.sitemaps.push(value.to_string()),
                _ => {}
            }
        }

        robots.commit(&current_agents, &current_rules);
        robots
    }

    fn commit(&mut self, agents: &[String], rules: &AgentRules) {
        for agent in agents {
            if agent == "*" {
                self.default_rules = rules.clone();
            } else {
                self.groups.insert(agent.clone(), rules.clone());
            }
        }
    }

    fn rules_for(&self, user_agent: &str) -> &AgentRules {
        let agent = user_agent.to_ascii_lowercase();
        self.groups
            .iter()
            .filter(|(token, _)| agent.contains(token.as_str()))
            .max_by_key(|(token, _)| token.len())
            .map(|(_, rules)| rules)
            .unwrap_or(&self.default_rules)
    }

    /// Whether `path` (path plus optional query) may be fetched by `user_agent`.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let rules = self.rules_for(user_agent);

        let longest = |patterns: &[String]| {
            patterns
                .iter()
                .filter(|p| pattern_matches(p, path))
                .map(|p| p.len())
                .max()
        };

        match (longest(&rules.allow), longest(&rules.disallow)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(d)) => a >= d,
        }
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.rules_for(user_agent)
            .crawl_delay
            .map(Duration::from_secs_f64)
    }

    pub fn sitemaps(&self) -> &[String] {
        &self.sitemaps
    }
}

/// Prefix match with `*` wildcards and a trailing `$` anchor.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();
    let rest: Vec<&str> = parts.collect();

    for (i, part) in rest.iter().enumerate() {
        if part.is_empty() {
            if i == rest.len() - 1 {
                return true;
            }
            continue;
        }
        let is_last = i == rest.len() - 1;
        if is_last && anchored {
            return path.len() >= pos + part.len() && path.ends_with(part);
        }
        match path[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }

    !anchored || pos == path.len()
}

/// Scheme, host and port: the robots and throttle key.
pub fn origin_key(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Lazily fetched robots.txt per origin, kept for the cache's lifetime.
pub struct RobotsCache {
    client: reqwest::Client,
    entries: Mutex<HashMap<String, Arc<RobotsTxt>>>,
}

impl RobotsCache {
    /// `client` should carry the crawler's user agent.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The parsed robots.txt for `url`'s origin, fetched on first use.
    ///
    /// The cache lock is not held across the request. Two tasks racing on a
    /// cold origin may both fetch; the first insert wins.
    pub async fn robots_for(&self, url: &Url) -> Arc<RobotsTxt> {
        let origin = origin_key(url);
        if let Some(robots) = self.entries.lock().await.get(&origin) {
            return Arc::clone(robots);
        }

        let fetched = Arc::new(self.fetch_robots(url).await);
        let mut entries = self.entries.lock().await;
        Arc::clone(entries.entry(origin).or_insert(fetched))
    }

    async fn fetch_robots(&self, url: &Url) -> RobotsTxt {
        let robots_url = match url.join("/robots.txt") {
            Ok(u) => u,
            Err(_) => return RobotsTxt::allow_all(),
        };

        match self.client.get(robots_url.clone()).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => RobotsTxt::parse(&body),
                Err(e) => {
                    tracing::debug!(url = %robots_url, error = %e, "could not read robots.txt, allowing");
                    RobotsTxt::allow_all()
                }
            },
            Ok(response) => {
                tracing::debug!(url = %robots_url, status = response.status().as_u16(), "no robots.txt, allowing");
                RobotsTxt::allow_all()
            }
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "robots.txt unreachable, allowing");
                RobotsTxt::allow_all()
            }
        }
    }
}
