use fail::FailScenario;

/// Configures failpoints for the duration of a test.
///
/// The underlying [`FailScenario`] serializes tests using failpoints. Every configured
/// failpoint is turned off again on drop.
pub struct FailpointScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> FailpointScenario<'a> {
    /// Sets each `(failpoint, action)` pair, e.g. `("outbox_relay.after_send", "return")`.
    pub fn setup(failpoints: &[(&str, &str)]) -> FailpointScenario<'a> {
        let scenario = FailScenario::setup();

        for (failpoint, action) in failpoints {
            fail::cfg(*failpoint, action).unwrap();
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints
                .iter()
                .map(|(failpoint, _)| failpoint.to_string())
                .collect(),
        }
    }

    /// Turns a failpoint off before the end of the scenario, e.g. before a restart.
    pub fn turn_off(&self, failpoint: &str) {
        fail::remove(failpoint);
    }
}

impl Drop for FailpointScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::remove(failpoint);
        }
    }
}
