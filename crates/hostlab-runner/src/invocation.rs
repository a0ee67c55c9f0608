use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharding {
    /// `--shards N`: the runner shards across N devices.
    Shards(u32),
    /// `--shard-count N`: the runner splits the plan into N shards.
    ShardCount(u32),
}

impl Sharding {
    /// `--shard-count` takes precedence when both are requested.
    pub fn resolve(shards: Option<u32>, shard_count: Option<u32>) -> Option<Self> {
        match (shards, shard_count) {
            (_, Some(count)) => Some(Sharding::ShardCount(count)),
            (Some(shards), None) => Some(Sharding::Shards(shards)),
            (None, None) => None,
        }
    }

    fn flag(&self) -> (&'static str, u32) {
        match self {
            Sharding::Shards(n) => ("--shards", *n),
            Sharding::ShardCount(n) => ("--shard-count", *n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInvocation {
    pub suite: String,
    pub plan: String,
    pub session_id: usize,
    pub sharding: Option<Sharding>,
    pub serials: Vec<String>,
}

impl RetryInvocation {
    pub fn new(suite: impl Into<String>, plan: impl Into<String>, session_id: usize) -> Self {
        Self {
            suite: suite.into(),
            plan: plan.into(),
            session_id,
            sharding: None,
            serials: Vec::new(),
        }
    }

    pub fn with_sharding(mut self, sharding: Option<Sharding>) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn with_serials(mut self, serials: &[String]) -> Self {
        self.serials = serials.to_vec();
        self
    }

    /// Arguments handed to the suite launcher after `run commandAndExit`.
    pub fn runner_args(&self) -> Vec<String> {
        let mut args = vec![
            self.plan.clone(),
            "--retry".to_string(),
            self.session_id.to_string(),
        ];
        if let Some(sharding) = self.sharding {
            let (flag, value) = sharding.flag();
            args.push(flag.to_string());
            args.push(value.to_string());
        }
        for serial in &self.serials {
            args.push("--serial".to_string());
            args.push(serial.clone());
        }
        args
    }

    /// Console argv, without the leading `test`.
    pub fn console_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--suite={}", self.suite),
            "--keep-result".to_string(),
            "--".to_string(),
        ];
        args.extend(self.runner_args());
        args
    }
}

impl fmt::Display for RetryInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test {}", self.console_args().join(" "))
    }
}
