use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Harness settings shared by every subcommand.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct HarnessConfig {
    /// Budget for a running coprocessor to report done.
    pub timeout_ms: u64,
    /// Back-off between idle mailbox polls.
    pub pause_ms: u64,
    /// RTC slow memory reserved for the ULP, e.g. "8176 B".
    pub reserved_memory: String,
    /// Longest accepted command line, e.g. "100 KiB".
    pub command_capacity: String,
    /// Word index the image is loaded at.
    pub load_addr: usize,
    pub entry_point: u32,
    /// Emulator cycle budget per run.
    pub max_cycles: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            pause_ms: 1,
            reserved_memory: "8176 B".to_string(),
            command_capacity: "100 KiB".to_string(),
            load_addr: 0,
            entry_point: 0,
            max_cycles: 8_000_000,
        }
    }
}

impl HarnessConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open harness config at {:?}", path.as_ref()))?;
        let config: Self =
            serde_yaml::from_reader(f).context("Failed to parse Harness Config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            anyhow::bail!("'timeout_ms' must be greater than zero");
        }
        if self.max_cycles == 0 {
            anyhow::bail!("'max_cycles' must be greater than zero");
        }
        let reserved = self.reserved_bytes()?;
        if reserved == 0 || reserved % 4 != 0 {
            anyhow::bail!(
                "'reserved_memory' must be a non-zero multiple of 4 bytes, got {}",
                reserved
            );
        }
        let in_window = self
            .load_addr
            .checked_mul(4)
            .is_some_and(|offset| offset < reserved);
        if !in_window {
            anyhow::bail!(
                "'load_addr' word {} is outside the {} reserved bytes",
                self.load_addr,
                reserved
            );
        }
        if self.command_capacity_bytes()? == 0 {
            anyhow::bail!("'command_capacity' must be greater than zero");
        }
        Ok(())
    }

    pub fn reserved_bytes(&self) -> Result<usize> {
        parse_size(&self.reserved_memory)
            .map(|b| b as usize)
            .context("Invalid 'reserved_memory'")
    }

    pub fn command_capacity_bytes(&self) -> Result<usize> {
        parse_size(&self.command_capacity)
            .map(|b| b as usize)
            .context("Invalid 'command_capacity'")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestInputs {
    pub image: String,
    pub config: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_cycles: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedOutcome {
    Done,
    ProtocolError,
    Timeout,
    LoadError,
    StartError,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OutputContainsAssertion {
    pub output_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OutputEqualsAssertion {
    pub output_equals: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OutcomeAssertion {
    pub expected_outcome: ExpectedOutcome,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TestAssertion {
    OutputContains(OutputContainsAssertion),
    OutputEquals(OutputEqualsAssertion),
    ExpectedOutcome(OutcomeAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    pub schema_version: String,
    pub inputs: TestInputs,
    #[serde(default)]
    pub limits: TestLimits,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

impl TestScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open test script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Test Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.inputs.image.trim().is_empty() {
            anyhow::bail!("Input 'image' path cannot be empty");
        }

        if self.limits.timeout_ms == Some(0) {
            anyhow::bail!("Limit 'timeout_ms' must be greater than zero");
        }

        if self.limits.max_cycles == Some(0) {
            anyhow::bail!("Limit 'max_cycles' must be greater than zero");
        }

        Ok(())
    }

    /// Applies the script's limits on top of `config`.
    pub fn apply_limits(&self, config: &mut HarnessConfig) {
        if let Some(timeout_ms) = self.limits.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(max_cycles) = self.limits.max_cycles {
            config.max_cycles = max_cycles;
        }
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
