//! 启发式恢复策略：后退导航守卫、模态框提示
//!
//! 两者相互独立，阈值可配置，设为 0 即关闭。

/// 视为「后退」的远程工具
pub const BACK_NAVIGATION_TOOLS: &[&str] = &["browser_navigate_back", "browser_go_back", "go_back"];

/// 工具名包含这些片段即视为交互类调用
const INTERACTION_MARKERS: &[&str] = &["click", "type", "select", "hover", "drag", "fill", "press"];

pub const MODAL_HINT: &str = "Several interactions in a row have failed. A modal dialog, cookie banner or overlay \
may be blocking the page. Take a snapshot, look for a dialog, and dismiss it (close button, Escape, or accept) \
before retrying.";

pub fn is_back_navigation(tool: &str) -> bool {
    BACK_NAVIGATION_TOOLS.contains(&tool)
}

pub fn is_interaction(tool: &str) -> bool {
    let tool = tool.to_ascii_lowercase();
    INTERACTION_MARKERS.iter().any(|m| tool.contains(m))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// 本地拒绝，内容作为工具结果写回对话
    Block(String),
}

/// 连续后退超过 limit 次后拒绝；任何其他工具调用清零
#[derive(Debug, Clone)]
pub struct BackNavigationGuard {
    limit: usize,
    consecutive: usize,
}

impl BackNavigationGuard {
    pub fn new(limit: usize) -> Self {
        Self { limit, consecutive: 0 }
    }

    pub fn check(&mut self, tool: &str) -> GuardDecision {
        if !is_back_navigation(tool) {
            self.consecutive = 0;
            return GuardDecision::Allow;
        }
        self.consecutive += 1;
        if self.limit > 0 && self.consecutive > self.limit {
            GuardDecision::Block(format!(
                "Blocked: {} consecutive back navigations. The history is likely exhausted; \
                 navigate explicitly to the URL you need instead.",
                self.consecutive
            ))
        } else {
            GuardDecision::Allow
        }
    }
}

/// 交互类调用连续失败达到阈值时给出一次提示，然后重新计数
#[derive(Debug, Clone)]
pub struct ModalHintPolicy {
    threshold: usize,
    consecutive_failures: usize,
}

impl ModalHintPolicy {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
        }
    }

    /// 记录一次工具结果；非交互类调用不影响计数
    pub fn record(&mut self, tool: &str, succeeded: bool) -> Option<String> {
        if self.threshold == 0 || !is_interaction(tool) {
            return None;
        }
        if succeeded {
            self.consecutive_failures = 0;
            return None;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.consecutive_failures = 0;
            Some(MODAL_HINT.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_blocks_third_and_later() {
        let mut guard = BackNavigationGuard::new(2);
        assert_eq!(guard.check("browser_navigate_back"), GuardDecision::Allow);
        assert_eq!(guard.check("browser_navigate_back"), GuardDecision::Allow);
        assert!(matches!(guard.check("browser_navigate_back"), GuardDecision::Block(_)));
        assert!(matches!(guard.check("browser_navigate_back"), GuardDecision::Block(_)));

        assert_eq!(guard.check("browser_snapshot"), GuardDecision::Allow);
        assert_eq!(guard.check("browser_navigate_back"), GuardDecision::Allow);
        assert_eq!(guard.check("browser_navigate_back"), GuardDecision::Allow);
        assert!(matches!(guard.check("browser_navigate_back"), GuardDecision::Block(_)));
    }

    #[test]
    fn test_guard_disabled() {
        let mut guard = BackNavigationGuard::new(0);
        for _ in 0..10 {
            assert_eq!(guard.check("go_back"), GuardDecision::Allow);
        }
    }

    #[test]
    fn test_modal_hint_after_threshold() {
        let mut policy = ModalHintPolicy::new(3);
        assert!(policy.record("browser_click", false).is_none());
        assert!(policy.record("browser_snapshot", true).is_none());
        assert!(policy.record("browser_type", false).is_none());
        assert_eq!(policy.record("browser_click", false).as_deref(), Some(MODAL_HINT));
        // 提示后重新计数
        assert!(policy.record("browser_click", false).is_none());
    }

    #[test]
    fn test_modal_success_resets() {
        let mut policy = ModalHintPolicy::new(3);
        policy.record("browser_click", false);
        policy.record("browser_click", false);
        policy.record("browser_click", true);
        assert!(policy.record("browser_click", false).is_none());
        assert!(ModalHintPolicy::new(0).record("browser_click", false).is_none());
    }

    #[test]
    fn test_interaction_classification() {
        assert!(is_interaction("browser_click"));
        assert!(is_interaction("browser_fill_form"));
        assert!(is_interaction("browser_select_option"));
        assert!(!is_interaction("browser_snapshot"));
        assert!(!is_interaction("browser_navigate"));
    }
}
