use crate::{
    build_harness, load_config, EXIT_ASSERT_FAIL, EXIT_CONFIG_ERROR, EXIT_PASS, EXIT_RUNTIME_ERROR,
};
use anyhow::{Context, Result};
use labwired_ulp_config::{ExpectedOutcome, HarnessConfig, TestAssertion, TestScript};
use labwired_ulp_core::{HarnessError, SupervisionOutcome};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
struct AssertionResult {
    assertion: String,
    passed: bool,
}

#[derive(Debug, Serialize)]
struct ResultConfig {
    script: String,
    image: String,
    timeout_ms: u64,
    max_cycles: u64,
}

#[derive(Debug, Serialize)]
struct TestResult {
    status: &'static str,
    outcome: ExpectedOutcome,
    output: String,
    messages: usize,
    elapsed_ms: u64,
    image_hash: String,
    assertions: Vec<AssertionResult>,
    config: ResultConfig,
}

/// Captures coprocessor output, optionally echoing it to stdout.
struct OutputCapture {
    captured: Vec<u8>,
    echo: bool,
}

impl Write for OutputCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.captured.extend_from_slice(buf);
        if self.echo {
            io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.echo {
            io::stdout().flush()?;
        }
        Ok(())
    }
}

struct Prepared {
    script: TestScript,
    config: HarnessConfig,
    image_path: PathBuf,
    image: Vec<u8>,
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn prepare(config_path: Option<&Path>, script_path: &Path) -> Result<Prepared> {
    let script = TestScript::from_file(script_path)?;
    let base = script_path.parent().unwrap_or_else(|| Path::new("."));

    let mut config = match &script.inputs.config {
        Some(path) => load_config(Some(&resolve(base, path)))?,
        None => load_config(config_path)?,
    };
    script.apply_limits(&mut config);
    config.validate()?;

    let image_path = resolve(base, &script.inputs.image);
    let image = labwired_ulp_loader::load_image(&image_path)
        .with_context(|| format!("Failed to load test image {:?}", image_path))?;
    Ok(Prepared {
        script,
        config,
        image_path,
        image,
    })
}

fn evaluate(assertion: &TestAssertion, outcome: ExpectedOutcome, output: &str) -> AssertionResult {
    match assertion {
        TestAssertion::OutputContains(a) => AssertionResult {
            assertion: format!("output_contains: {:?}", a.output_contains),
            passed: output.contains(&a.output_contains),
        },
        TestAssertion::OutputEquals(a) => AssertionResult {
            assertion: format!("output_equals: {:?}", a.output_equals),
            passed: output == a.output_equals,
        },
        TestAssertion::ExpectedOutcome(a) => AssertionResult {
            assertion: format!("expected_outcome: {:?}", a.expected_outcome),
            passed: outcome == a.expected_outcome,
        },
    }
}

/// Runs a test script and returns the process exit code.
pub fn run_test(
    config_path: Option<&Path>,
    script_path: &Path,
    output_dir: Option<&Path>,
    no_output_stdout: bool,
) -> u8 {
    let prepared = match prepare(config_path, script_path) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };
    match execute(&prepared, script_path, output_dir, no_output_stdout) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_RUNTIME_ERROR
        }
    }
}

fn execute(
    prepared: &Prepared,
    script_path: &Path,
    output_dir: Option<&Path>,
    no_output_stdout: bool,
) -> Result<u8> {
    let (mut supervisor, mut coprocessor) = build_harness(&prepared.config)?;
    let mut capture = OutputCapture {
        captured: Vec::new(),
        echo: !no_output_stdout,
    };

    let (outcome, messages, elapsed_ms) =
        match supervisor.supervise(&mut coprocessor, &prepared.image, &mut capture) {
            Ok(report) => {
                let outcome = match report.outcome {
                    SupervisionOutcome::Done => ExpectedOutcome::Done,
                    SupervisionOutcome::ProtocolError { .. } => ExpectedOutcome::ProtocolError,
                    SupervisionOutcome::Timeout { .. } => ExpectedOutcome::Timeout,
                };
                (outcome, report.messages, report.elapsed_ms)
            }
            Err(HarnessError::Load(e)) => {
                warn!("Load failed: {}", e);
                (ExpectedOutcome::LoadError, 0, 0)
            }
            Err(HarnessError::Start(e)) => {
                warn!("Start failed: {}", e);
                (ExpectedOutcome::StartError, 0, 0)
            }
            Err(e) => return Err(e).context("Supervision failed"),
        };
    if !no_output_stdout && !capture.captured.is_empty() {
        println!();
    }

    let output = String::from_utf8_lossy(&capture.captured).into_owned();
    let mut assertions: Vec<AssertionResult> = prepared
        .script
        .assertions
        .iter()
        .map(|a| evaluate(a, outcome, &output))
        .collect();

    // Without an explicit outcome assertion the run has to finish cleanly.
    let has_outcome = prepared
        .script
        .assertions
        .iter()
        .any(|a| matches!(a, TestAssertion::ExpectedOutcome(_)));
    if !has_outcome {
        assertions.push(AssertionResult {
            assertion: "expected_outcome: Done (implicit)".to_string(),
            passed: outcome == ExpectedOutcome::Done,
        });
    }

    for result in &assertions {
        if result.passed {
            info!("PASS {}", result.assertion);
        } else {
            warn!("FAIL {}", result.assertion);
        }
    }
    let passed = assertions.iter().all(|a| a.passed);

    let result = TestResult {
        status: if passed { "pass" } else { "fail" },
        outcome,
        output,
        messages,
        elapsed_ms,
        image_hash: format!("{:x}", Sha256::digest(&prepared.image)),
        assertions,
        config: ResultConfig {
            script: script_path.display().to_string(),
            image: prepared.image_path.display().to_string(),
            timeout_ms: prepared.config.timeout_ms,
            max_cycles: prepared.config.max_cycles,
        },
    };

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
        let path = dir.join("result.json");
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Wrote {:?}", path);
    }

    info!("Test {}: outcome {:?}", result.status, outcome);
    Ok(if passed { EXIT_PASS } else { EXIT_ASSERT_FAIL })
}
