#![forbid(unsafe_code)]

//! CLI runner for the recovery engine: pipes JSON requests through the
//! pipeline.
//!
//! Subcommands:
//! - `run <request.json|->`      — run one engine request, print the response
//! - `batch <requests.json|->`   — run a JSON array of requests
//! - `simulate <graph.json|-> <scenario-id> [max-ticks]` — bare seeded
//!   simulation of a graph (no plan, no policy gate)

use std::fs;
use std::io::Read;

use anyhow::{Context, Result};
use mend_engine::engine::{EngineRequest, run_engine, run_engine_batch};
use mend_engine::incident_graph::{IncidentGraph, normalize};
use mend_engine::simulator::simulate_with_seed;

fn main() {
    let exit_code = match run(std::env::args().skip(1).collect()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{error:#}");
            2
        }
    };
    std::process::exit(exit_code);
}

fn run(args: Vec<String>) -> Result<i32> {
    if args.is_empty() {
        anyhow::bail!("{}", usage());
    }
    match args[0].as_str() {
        "run" => run_single(&args[1..]),
        "batch" => run_batch(&args[1..]),
        "simulate" => run_simulate(&args[1..]),
        "help" | "--help" | "-h" => {
            println!("{}", usage());
            Ok(0)
        }
        other => anyhow::bail!("unknown subcommand '{other}'\n\n{}", usage()),
    }
}

fn run_single(args: &[String]) -> Result<i32> {
    let request: EngineRequest = read_json(args.first())?;
    match run_engine(&request) {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(0)
        }
        Err(error) => {
            eprintln!("engine error: {error}");
            Ok(1)
        }
    }
}

fn run_batch(args: &[String]) -> Result<i32> {
    let requests: Vec<EngineRequest> = read_json(args.first())?;
    let responses = run_engine_batch(requests);
    println!("{}", serde_json::to_string_pretty(&responses)?);
    let all_accepted = responses.iter().all(|r| r.accepted);
    Ok(if all_accepted { 0 } else { 1 })
}

fn run_simulate(args: &[String]) -> Result<i32> {
    let graph: IncidentGraph = read_json(args.first())?;
    let scenario_id = args
        .get(1)
        .context("simulate requires a scenario id argument")?;
    let max_ticks: u64 = match args.get(2) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid max-ticks '{raw}'"))?,
        None => 64,
    };
    let result = simulate_with_seed(&normalize(&graph), &[], max_ticks, scenario_id);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn read_json<T: serde::de::DeserializeOwned>(path: Option<&String>) -> Result<T> {
    let path = path.context("missing input path (use '-' for stdin)")?;
    let raw = if path == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading stdin")?;
        buffer
    } else {
        fs::read_to_string(path).with_context(|| format!("reading {path}"))?
    };
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn usage() -> String {
    [
        "mend-plan-runner — incident-recovery engine runner",
        "",
        "usage:",
        "  mend_plan_runner run <request.json|->",
        "  mend_plan_runner batch <requests.json|->",
        "  mend_plan_runner simulate <graph.json|-> <scenario-id> [max-ticks]",
    ]
    .join("\n")
}
