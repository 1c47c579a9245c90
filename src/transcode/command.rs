use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use tracing::debug;

use crate::config::TranscodeConfig;
use crate::error::{FfpilotError, Result};
use super::spec::{InputSource, InputSpec, OutputSpec};

/// A resolved invocation: the flat argument vector plus whether the outputs
/// were multiplexed through the tee muxer.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub args: Vec<String>,
    pub tee_active: bool,
}

/// Codec-selection flag, optionally scoped to a stream type: `-c`, `-codec`,
/// `-c:v`, `-codec:a`, ...
static CODEC_FLAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-(?:c|codec)(?::[A-Za-z]+)?$").unwrap());

/// Options the tee muxer accepts inline, per destination.
static MUXER_FLAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-(f|movflags|fflags|flags)$").unwrap());

/// Build the ordered argument vector for one invocation.
pub fn build(
    config: &TranscodeConfig,
    inputs: &[InputSpec],
    outputs: &[OutputSpec],
) -> Result<Vec<String>> {
    Ok(plan(config, inputs, outputs)?.args)
}

/// `build` plus the tee decision, for callers that need to know how many
/// logical outputs one settlement accounts for.
pub fn plan(
    config: &TranscodeConfig,
    inputs: &[InputSpec],
    outputs: &[OutputSpec],
) -> Result<CommandPlan> {
    validate(config, inputs, outputs)?;

    let mut args: Vec<String> = Vec::new();

    // Global slice, with the derived flags appended so they cover the whole
    // invocation.
    args.extend(tokenize(&config.global_options));
    args.push(if config.overwrite_existing { "-y" } else { "-n" }.to_string());
    if config.hide_banner {
        args.push("-hide_banner".to_string());
    }

    // Input phase.
    args.extend(tokenize(&config.input_options));
    for input in inputs {
        args.extend(tokenize(&input.options));
        args.push("-i".to_string());
        args.push(input.resolved_source().to_string());
    }

    // Output phase.
    args.extend(tokenize(&config.output_options));
    let tee_args = if config.tee && outputs.len() > 1 {
        tee_rewrite(outputs)
    } else {
        None
    };
    let tee_active = tee_args.is_some();
    match tee_args {
        Some(tee_args) => args.extend(tee_args),
        None => {
            for output in outputs {
                args.extend(tokenize(&output.options));
                args.push(output.resolved_target().to_string());
            }
        }
    }

    args.retain(|token| !token.trim().is_empty());
    Ok(CommandPlan { args, tee_active })
}

fn validate(config: &TranscodeConfig, inputs: &[InputSpec], outputs: &[OutputSpec]) -> Result<()> {
    if config.binary_path.trim().is_empty() {
        return Err(FfpilotError::Config("missing binary path".to_string()));
    }
    if inputs.is_empty() {
        return Err(FfpilotError::Config("no input specified".to_string()));
    }
    if outputs.is_empty() {
        return Err(FfpilotError::Config("no output specified".to_string()));
    }

    let pipe_count = outputs.iter().filter(|output| output.is_pipe()).count();
    if pipe_count > 1 {
        return Err(FfpilotError::Config(
            "only one output may be pipe-backed".to_string(),
        ));
    }
    if pipe_count == 1 && !outputs[outputs.len() - 1].is_pipe() {
        return Err(FfpilotError::Config(
            "the pipe-backed output must come last".to_string(),
        ));
    }

    for output in outputs {
        if let super::spec::OutputTarget::Path(path) = &output.target {
            if path.trim().is_empty() {
                return Err(FfpilotError::Config(
                    "empty output destination".to_string(),
                ));
            }
        }
    }

    for input in inputs {
        let InputSource::Path(path) = &input.source else {
            continue;
        };
        if path.trim().is_empty() {
            return Err(FfpilotError::Config("empty input source".to_string()));
        }
        if super::spec::is_synthetic_source(path) || selects_lavfi(&input.options) {
            continue;
        }
        let candidate = match &config.cwd {
            Some(cwd) => cwd.join(path),
            None => PathBuf::from(path),
        };
        if !candidate.exists() {
            return Err(FfpilotError::InputNotFound(path.clone()));
        }
    }

    Ok(())
}

/// Option strings may carry several whitespace-separated tokens
/// (`"-c copy"`); split them so the subprocess sees one token per argument.
fn tokenize(options: &[String]) -> Vec<String> {
    options
        .iter()
        .flat_map(|option| option.split_whitespace())
        .map(str::to_string)
        .collect()
}

fn selects_lavfi(options: &[String]) -> bool {
    tokenize(options)
        .windows(2)
        .any(|pair| pair[0] == "-f" && pair[1] == "lavfi")
}

/// Attempt the tee rewrite. Returns `None` when the outputs are not
/// tee-compatible; the caller then degrades to standard mode.
fn tee_rewrite(outputs: &[OutputSpec]) -> Option<Vec<String>> {
    if outputs.iter().any(|output| output.is_pipe()) {
        debug!("tee disabled: a pipe-backed output cannot join a tee fan-out");
        return None;
    }

    let token_sets: Vec<Vec<(String, String)>> = outputs
        .iter()
        .map(|output| codec_tokens(&tokenize(&output.options)))
        .collect();
    let shared = &token_sets[0];
    if token_sets.iter().any(|tokens| tokens != shared) {
        debug!("tee disabled: codec selection differs between outputs");
        return None;
    }

    let mut args = Vec::new();
    for index in 0..outputs.len() {
        for (flag, value) in shared {
            args.push(format!("{}:{}", flag, index));
            args.push(value.clone());
        }
    }
    args.push("-map".to_string());
    args.push("0".to_string());
    args.push("-f".to_string());
    args.push("tee".to_string());
    let destinations: Vec<String> = outputs.iter().map(tee_destination).collect();
    args.push(destinations.join("|"));
    Some(args)
}

fn codec_tokens(tokens: &[String]) -> Vec<(String, String)> {
    let mut found = Vec::new();
    let mut index = 0;
    while index < tokens.len() {
        if CODEC_FLAG.is_match(&tokens[index]) && index + 1 < tokens.len() {
            found.push((tokens[index].clone(), tokens[index + 1].clone()));
            index += 2;
        } else {
            index += 1;
        }
    }
    found
}

/// One tee branch: the destination wrapped in its muxer-only options,
/// `[f=matroska:movflags=+faststart]path`.
fn tee_destination(output: &OutputSpec) -> String {
    let tokens = tokenize(&output.options);
    let mut muxer_options = Vec::new();
    let mut index = 0;
    while index < tokens.len() {
        if let Some(captures) = MUXER_FLAG.captures(&tokens[index]) {
            if index + 1 < tokens.len() {
                muxer_options.push(format!("{}={}", &captures[1], tokens[index + 1]));
                index += 2;
                continue;
            }
        }
        index += 1;
    }

    let destination = output.resolved_target();
    if muxer_options.is_empty() {
        destination.to_string()
    } else {
        format!("[{}]{}", muxer_options.join(":"), destination)
    }
}
