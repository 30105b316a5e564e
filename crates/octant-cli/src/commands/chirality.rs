//! `octantctl chirality` - system-wide mode.
//!
//! - `octantctl chirality status`
//! - `octantctl chirality flip <production|development|toggle>`
//! - `octantctl chirality selective <vertex> <activate|deactivate>`
//! - `octantctl chirality diff [target]`
//!
//! A flip that could not start or stop some services still succeeds; the
//! per-service problems are printed as warnings.

use clap::{Args, Subcommand};
use octant_core::chirality::{FlipPlan, FlipReport, SelectiveAction};
use octant_core::{FlipTarget, Vertex};

use super::{Context, exit_codes, output_error, print_json};

/// Chirality command group.
#[derive(Debug, Args)]
pub struct ChiralityCommand {
    #[command(subcommand)]
    pub subcommand: ChiralitySubcommand,
}

/// Chirality subcommands.
#[derive(Debug, Subcommand)]
pub enum ChiralitySubcommand {
    /// Show the current mode and every vertex's state.
    Status,

    /// Move the system to a mode.
    Flip(FlipArgs),

    /// Activate or deactivate one vertex's chiral partner.
    Selective(SelectiveArgs),

    /// Show what a flip would change, without changing anything.
    Diff(DiffArgs),
}

/// Arguments for `octantctl chirality flip`.
#[derive(Debug, Args)]
pub struct FlipArgs {
    /// Target mode: production, development or toggle.
    pub target: FlipTarget,
}

/// Arguments for `octantctl chirality selective`.
#[derive(Debug, Args)]
pub struct SelectiveArgs {
    /// Vertex whose partner changes.
    pub vertex: Vertex,

    /// activate or deactivate.
    pub action: SelectiveAction,
}

/// Arguments for `octantctl chirality diff`.
#[derive(Debug, Args)]
pub struct DiffArgs {
    /// Target mode; the opposite of the current mode if omitted.
    #[arg(default_value = "toggle")]
    pub target: FlipTarget,
}

/// Runs a chirality command.
pub fn run_chirality(cmd: &ChiralityCommand, ctx: &Context) -> u8 {
    match &cmd.subcommand {
        ChiralitySubcommand::Status => run_status(ctx),
        ChiralitySubcommand::Flip(args) => run_flip(args, ctx),
        ChiralitySubcommand::Selective(args) => run_selective(args, ctx),
        ChiralitySubcommand::Diff(args) => run_diff(args, ctx),
    }
}

fn run_status(ctx: &Context) -> u8 {
    let status = match ctx.chirality().status() {
        Ok(status) => status,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&status);
        return exit_codes::SUCCESS;
    }

    println!("Mode: {}", status.mode);
    for row in &status.vertices {
        println!("  {:<5} {:<12} {}", row.vertex, row.name, row.state);
    }
    exit_codes::SUCCESS
}

fn run_flip(args: &FlipArgs, ctx: &Context) -> u8 {
    let report = match ctx.chirality().flip(args.target) {
        Ok(report) => report,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&report);
    } else {
        print_report(&report);
    }
    if report.completed {
        exit_codes::SUCCESS
    } else {
        exit_codes::ERROR
    }
}

fn print_report(report: &FlipReport) {
    if report.already {
        println!("Already in {} mode", report.to);
        return;
    }
    let verb = if report.completed { "Flipped" } else { "Partially flipped" };
    println!("{verb} {} -> {}", report.from, report.to);
    for t in &report.changed_vertices {
        println!("  {} {} -> {}", t.vertex, t.from, t.to);
    }
    for name in &report.started_services {
        println!("  started {name}");
    }
    for name in &report.stopped_services {
        println!("  stopped {name}");
    }
    for problem in &report.degraded {
        eprintln!("warning: {problem}");
    }
    if !report.completed {
        eprintln!(
            "Error: {} service(s) failed; mode left at {}, re-run the flip to retry",
            report.failed.len(),
            report.from
        );
    }
}

fn run_selective(args: &SelectiveArgs, ctx: &Context) -> u8 {
    let transition = match ctx.chirality().selective(args.vertex, args.action) {
        Ok(transition) => transition,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&transition);
    } else {
        println!(
            "{} (partner of {}): {} -> {}",
            transition.vertex, args.vertex, transition.from, transition.to
        );
    }
    exit_codes::SUCCESS
}

fn run_diff(args: &DiffArgs, ctx: &Context) -> u8 {
    let plan = match ctx.chirality().diff(args.target) {
        Ok(plan) => plan,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&plan);
    } else {
        print_plan(&plan);
    }
    exit_codes::SUCCESS
}

fn print_plan(plan: &FlipPlan) {
    if plan.is_noop() {
        println!("Already in {} mode; nothing to change", plan.to);
        return;
    }
    println!("{} -> {}", plan.from, plan.to);
    if plan.transitions.is_empty() && plan.start.is_empty() && plan.stop.is_empty() {
        println!("  (no vertex or service changes)");
    }
    for t in &plan.transitions {
        println!("  {} {} -> {}", t.vertex, t.from, t.to);
    }
    for name in &plan.start {
        println!("  + start {name}");
    }
    for name in &plan.stop {
        println!("  - stop {name}");
    }
}
