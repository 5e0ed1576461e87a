//! The per-thread symbol stack
//!
//! [`SetSymbolDuringMethodCall`](crate::scripts::SetSymbolDuringMethodCall)
//! brackets designated calls with a push and a balanced pop of a chosen
//! string, so code downstream can ask "am I being called from inside X?".
//! The stack is process-wide but partitioned per thread; it is empty at
//! thread start and after every balanced pair, including exceptional exits.

use std::cell::RefCell;

thread_local! {
    static STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub fn push(symbol: &str) {
    STACK.with(|stack| stack.borrow_mut().push(symbol.to_string()));
}

pub fn pop() -> Option<String> {
    STACK.with(|stack| stack.borrow_mut().pop())
}

pub fn size() -> usize {
    STACK.with(|stack| stack.borrow().len())
}

pub fn is_empty() -> bool {
    size() == 0
}

/// True if `symbol` occurs anywhere on this thread's stack.
pub fn has_symbol(symbol: &str) -> bool {
    STACK.with(|stack| stack.borrow().iter().any(|s| s == symbol))
}

/// True if `symbol` is the topmost entry on this thread's stack.
pub fn has_tail(symbol: &str) -> bool {
    STACK.with(|stack| stack.borrow().last().map(|s| s == symbol).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_push_pop() {
        assert!(is_empty());
        push("Foobar");
        assert_eq!(size(), 1);
        assert!(has_symbol("Foobar"));
        assert!(has_tail("Foobar"));
        assert!(!has_symbol("Other"));

        push("Inner");
        assert_eq!(size(), 2);
        assert!(has_symbol("Foobar"));
        assert!(!has_tail("Foobar"));
        assert!(has_tail("Inner"));

        assert_eq!(pop().as_deref(), Some("Inner"));
        assert_eq!(pop().as_deref(), Some("Foobar"));
        assert!(is_empty());
        assert_eq!(pop(), None);
    }

    #[test]
    fn threads_do_not_share_stacks() {
        push("main-only");
        let seen = std::thread::spawn(|| (is_empty(), has_symbol("main-only")))
            .join()
            .unwrap();
        assert_eq!(seen, (true, false));
        assert_eq!(pop().as_deref(), Some("main-only"));
    }
}
