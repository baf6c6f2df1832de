// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Generic robots.txt parsing and matching, independent of any particular
//! crawler or cache. [`politeness`](../politeness/index.html) wraps this
//! with fetching, caching and the spec's failure-default semantics.

mod parser;
mod pattern;

use parser::Line;
use pattern::Pattern;
use std::time::Duration;

struct Rule {
    pattern: Pattern,
    allow: bool,
}

struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
    crawl_delay: Option<f32>,
}

impl Group {
    fn matches_agent(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        self.agents
            .iter()
            .any(|a| a != "*" && ua.contains(&a.to_lowercase()))
    }

    fn is_wildcard(&self) -> bool {
        self.agents.iter().any(|a| a == "*")
    }
}

/// A parsed robots.txt document.
#[derive(Default)]
pub struct RobotsTxt {
    groups: Vec<Group>,
    sitemaps: Vec<String>,
}

impl RobotsTxt {
    /// Parses `text`. Malformed or empty input yields an effectively-empty
    /// document (no rules => everything allowed), never an error: robots.txt
    /// in the wild is rarely fully compliant and the tokenizer in
    /// [`parser`] already tolerates common mistakes.
    pub fn parse(text: &str) -> Self {
        let lines = match parser::parse(text) {
            Ok((_, lines)) => lines,
            Err(_) => return Self::default(),
        };

        let mut groups: Vec<Group> = Vec::new();
        let mut sitemaps = Vec::new();
        let mut current: Option<Group> = None;
        let mut awaiting_agents = false;

        for line in lines {
            match line {
                Line::UserAgent(agents) => {
                    let agents: Vec<String> = agents.into_iter().map(|a| a.to_string()).collect();
                    if awaiting_agents {
                        if let Some(g) = current.as_mut() {
                            g.agents.extend(agents);
                            continue;
                        }
                    }
                    if let Some(g) = current.take() {
                        groups.push(g);
                    }
                    current = Some(Group {
                        agents,
                        rules: Vec::new(),
                        crawl_delay: None,
                    });
                    awaiting_agents = true;
                }
                Line::Allow(p) => {
                    awaiting_agents = false;
                    if let Some(g) = current.as_mut() {
                        g.rules.push(Rule {
                            pattern: Pattern::new(p),
                            allow: true,
                        });
                    }
                }
                Line::Disallow(p) => {
                    awaiting_agents = false;
                    if let Some(g) = current.as_mut() {
                        if !p.is_empty() {
                            g.rules.push(Rule {
                                pattern: Pattern::new(p),
                                allow: false,
                            });
                        }
                    }
                }
                Line::CrawlDelay(d) => {
                    awaiting_agents = false;
                    if let Some(g) = current.as_mut() {
                        g.crawl_delay = d;
                    }
                }
                Line::Sitemap(s) => {
                    awaiting_agents = false;
                    if !s.is_empty() {
                        sitemaps.push(s.to_string());
                    }
                }
                Line::Raw(()) => {
                    awaiting_agents = false;
                }
            }
        }
        if let Some(g) = current.take() {
            groups.push(g);
        }

        for g in &mut groups {
            g.rules.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        }

        Self { groups, sitemaps }
    }

    fn select_group(&self, user_agent: &str) -> Option<&Group> {
        self.groups
            .iter()
            .find(|g| g.matches_agent(user_agent))
            .or_else(|| self.groups.iter().find(|g| g.is_wildcard()))
    }

    /// Whether `user_agent` may fetch `path` per this document. Absent any
    /// applicable group or matching rule, the default is `true`.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let Some(group) = self.select_group(user_agent) else {
            return true;
        };

        for rule in &group.rules {
            if rule.pattern.matches(path) {
                return rule.allow;
            }
        }

        true
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.select_group(user_agent)
            .and_then(|g| g.crawl_delay)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(Duration::from_secs_f32)
    }

    pub fn sitemaps(&self) -> &[String] {
        &self.sitemaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallow_is_respected() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /private\n");
        assert!(robots.is_allowed("anybot", "/public"));
        assert!(!robots.is_allowed("anybot", "/private/x"));
    }

    #[test]
    fn user_agent_match_is_case_insensitive() {
        let robots = RobotsTxt::parse("User-agent: FarCrawlBot\nDisallow: /x\n");
        assert!(!robots.is_allowed("farcrawlbot/1.0", "/x"));
        assert!(robots.is_allowed("farcrawlbot/1.0", "/y"));
    }

    #[test]
    fn specific_group_overrides_wildcard() {
        let robots = RobotsTxt::parse(
            "User-agent: *\nDisallow: /\n\nUser-agent: farcrawlbot\nDisallow: /private\n",
        );
        assert!(robots.is_allowed("farcrawlbot", "/public"));
        assert!(!robots.is_allowed("farcrawlbot", "/private"));
        assert!(!robots.is_allowed("otherbot", "/public"));
    }

    #[test]
    fn longest_match_wins() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /a\nAllow: /a/b\n");
        assert!(robots.is_allowed("bot", "/a/b"));
        assert!(!robots.is_allowed("bot", "/a/c"));
    }

    #[test]
    fn extra_blank_lines_between_groups_are_tolerated() {
        let robots = RobotsTxt::parse("User-agent: a\n\n\nDisallow: /x\n\n\nUser-agent: b\nDisallow: /y\n");
        assert!(!robots.is_allowed("a", "/x"));
        assert!(robots.is_allowed("a", "/y"));
    }

    #[test]
    fn multiple_agents_share_one_group() {
        let robots = RobotsTxt::parse("User-agent: a\nUser-agent: b\nDisallow: /z\n");
        assert!(!robots.is_allowed("a", "/z"));
        assert!(!robots.is_allowed("b", "/z"));
    }

    #[test]
    fn extracts_crawl_delay() {
        let robots = RobotsTxt::parse("User-agent: *\nCrawl-delay: 3\n");
        assert_eq!(robots.crawl_delay("bot"), Some(Duration::from_secs(3)));
    }

    #[test]
    fn extracts_sitemaps() {
        let robots = RobotsTxt::parse(
            "Sitemap: http://example.com/sitemap1.xml\nSitemap: http://example.com/sitemap2.xml\n",
        );
        assert_eq!(robots.sitemaps().len(), 2);
    }

    #[test]
    fn empty_or_malformed_input_allows_everything() {
        let robots = RobotsTxt::parse("");
        assert!(robots.is_allowed("bot", "/anything"));
    }

    #[test]
    fn empty_disallow_value_means_allow_all() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow:\n");
        assert!(robots.is_allowed("bot", "/anything"));
    }
}
