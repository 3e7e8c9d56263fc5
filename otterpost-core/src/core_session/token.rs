//! Latest-only request tokens
//!
//! A per-parameter fetch (focused contact, open conversation, reload) takes
//! a token when it starts; its completion is applied only if no newer
//! request was issued in the meantime.

#[derive(Debug, Default, Clone)]
pub struct RequestGate {
    current: u64,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request, invalidating every earlier token
    pub fn issue(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    pub fn is_current(&self, token: u64) -> bool {
        token == self.current
    }

    /// Invalidate outstanding tokens without starting a request
    pub fn invalidate(&mut self) {
        self.current += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_latest_token_is_current() {
        let mut gate = RequestGate::new();
        let a = gate.issue();
        let b = gate.issue();
        assert!(!gate.is_current(a));
        assert!(gate.is_current(b));

        gate.invalidate();
        assert!(!gate.is_current(b));
    }
}
