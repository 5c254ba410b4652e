//! Automated-traffic classification.
//!
//! Crawler and monitoring traffic must never consume identity slots: every
//! hit from a search bot would otherwise mint a fresh visitor row and a
//! cookie nothing will ever send back. The reconciler consults a
//! [`BotClassifier`] before attempting any creation and routes automated
//! traffic to a single shared synthetic identity instead.
//!
//! The trait is the contract; [`HeuristicBotClassifier`] is a default
//! implementation good enough for most storefronts. Hosts with better
//! signals (reverse DNS, IP reputation) can supply their own.

/// Predicate deciding whether a request comes from automated traffic.
pub trait BotClassifier: Send + Sync {
    fn is_automated(&self, remote_addr: &str, user_agent: &str, path: &str) -> bool;
}

/// Substrings that mark a user-agent as automated. One would hope real
/// browsers never include these; bots that lie get a profile like anyone
/// else and are cleaned up by the retirement sweep.
const AGENT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "preview",
    "slurp",
    "pinterest.com",
];

/// Path fragments served to machines rather than shoppers: feeds, cron
/// endpoints, and the login/registration pages (until a login completes we
/// cannot tell a person from a credential stuffer, and a successful login
/// bypasses classification entirely).
const PATH_MARKERS: &[&str] = &["login", "register", "cron", "/feed", "rss"];

/// Default user-agent and path heuristics.
#[derive(Debug, Default, Clone)]
pub struct HeuristicBotClassifier;

impl BotClassifier for HeuristicBotClassifier {
    fn is_automated(&self, _remote_addr: &str, user_agent: &str, path: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        if AGENT_MARKERS.iter().any(|m| ua.contains(m)) {
            return true;
        }

        let path = path.to_ascii_lowercase();
        PATH_MARKERS.iter().any(|m| path.contains(m))
    }
}

/// Classifier that always answers the same thing. Handy for hosts that do
/// their own classification upstream, and for tests.
#[derive(Debug, Clone)]
pub struct FixedBotClassifier(pub bool);

impl BotClassifier for FixedBotClassifier {
    fn is_automated(&self, _remote_addr: &str, _user_agent: &str, _path: &str) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_crawler_agents() {
        let c = HeuristicBotClassifier;
        for ua in [
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "Mozilla/5.0 (compatible; bingbot/2.0)",
            "Screaming Frog SEO Spider/19.0",
            "Mozilla/5.0 (compatible; YandexCrawler/1.0)",
            "Slurp/3.0",
        ] {
            assert!(c.is_automated("198.51.100.1", ua, "/products"), "{ua}");
        }
    }

    #[test]
    fn test_browser_agents_pass() {
        let c = HeuristicBotClassifier;
        for ua in [
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Safari/605.1.15",
        ] {
            assert!(!c.is_automated("198.51.100.1", ua, "/products"), "{ua}");
        }
    }

    #[test]
    fn test_machine_paths() {
        let c = HeuristicBotClassifier;
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";
        assert!(c.is_automated("198.51.100.1", ua, "/login"));
        assert!(c.is_automated("198.51.100.1", ua, "/blog/feed/"));
        assert!(c.is_automated("198.51.100.1", ua, "/?action=rss"));
        assert!(!c.is_automated("198.51.100.1", ua, "/cart"));
    }
}
