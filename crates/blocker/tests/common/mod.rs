use async_trait::async_trait;
use sitefence_blocker::pf::{FirewallError, FirewallPort};
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MockFirewallInner {
    pub enabled: bool,
    pub enable_fails: bool,
    pub fail_load: bool,
    pub load_calls: u32,
    pub flush_calls: u32,
    pub loaded_rules: Option<String>,
    pub packets: u64,
}

/// Scripted in-memory firewall. Counters reset on every rule load and
/// flush, matching PF's behavior.
#[derive(Debug, Default)]
pub struct MockFirewall {
    pub inner: Mutex<MockFirewallInner>,
}

impl MockFirewall {
    pub fn enabled() -> Arc<Self> {
        let fw = Self::default();
        fw.inner.lock().unwrap().enabled = true;
        Arc::new(fw)
    }

    pub fn broken() -> Arc<Self> {
        let fw = Self::default();
        fw.inner.lock().unwrap().enable_fails = true;
        Arc::new(fw)
    }

    pub fn set_packets(&self, count: u64) {
        self.inner.lock().unwrap().packets = count;
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.inner.lock().unwrap().fail_load = fail;
    }

    pub fn load_calls(&self) -> u32 {
        self.inner.lock().unwrap().load_calls
    }

    pub fn flush_calls(&self) -> u32 {
        self.inner.lock().unwrap().flush_calls
    }

    pub fn loaded_rules(&self) -> Option<String> {
        self.inner.lock().unwrap().loaded_rules.clone()
    }
}

#[async_trait]
impl FirewallPort for MockFirewall {
    async fn is_enabled(&self) -> Result<bool, FirewallError> {
        Ok(self.inner.lock().unwrap().enabled)
    }

    async fn enable(&self) -> Result<String, FirewallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.enable_fails {
            Err(FirewallError("pfctl: permission denied".to_string()))
        } else {
            inner.enabled = true;
            Ok("pf enabled".to_string())
        }
    }

    async fn load_anchor(&self, rules: &str) -> Result<(), FirewallError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_load {
            return Err(FirewallError("syntax error".to_string()));
        }
        inner.load_calls += 1;
        inner.loaded_rules = Some(rules.to_string());
        inner.packets = 0;
        Ok(())
    }

    async fn flush_anchor(&self) -> Result<(), FirewallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.flush_calls += 1;
        inner.loaded_rules = None;
        inner.packets = 0;
        Ok(())
    }

    async fn rule_stats(&self) -> Result<String, FirewallError> {
        let inner = self.inner.lock().unwrap();
        match &inner.loaded_rules {
            Some(rules) => Ok(format!(
                "{rules}  [ Evaluations: 0  Packets: {}  Bytes: 0  States: 0 ]\n",
                inner.packets
            )),
            None => Ok(String::new()),
        }
    }

    async fn label_stats(&self) -> Result<String, FirewallError> {
        Ok(String::new())
    }
}
