//! `octantctl membrane` - membrane lifecycle.
//!
//! - `octantctl membrane create <name> <vertex> [limits]`
//! - `octantctl membrane inspect <name>`
//! - `octantctl membrane list`
//! - `octantctl membrane stretch <name> [--memory SIZE] [--cpu WEIGHT]`
//! - `octantctl membrane contract <name>`
//! - `octantctl membrane destroy <name>`
//! - `octantctl membrane run <name> <vertex> -- <command> [args...]`
//! - `octantctl membrane stop <name>`
//!
//! Degraded isolation never fails a command: the operation is reported as
//! done and the degradation is printed as a warning.

use clap::{Args, Subcommand};
use octant_core::Vertex;
use octant_core::membrane::{
    DestroyOutcome, Inspection, LimitChange, LimitOverrides, LiveStatus, MembraneChange,
    RunOutcome, StretchRequest,
};
use octant_core::size::{format_size, parse_size};
use octant_core::store::MembraneDescriptor;

use super::{Context, exit_codes, or_dash, output_error, print_json, print_mutation, print_warnings};

/// Membrane command group.
#[derive(Debug, Args)]
pub struct MembraneCommand {
    #[command(subcommand)]
    pub subcommand: MembraneSubcommand,
}

/// Membrane subcommands.
#[derive(Debug, Subcommand)]
pub enum MembraneSubcommand {
    /// Create (or update) a membrane on a vertex.
    Create(CreateArgs),

    /// Show a membrane's descriptor and live usage.
    Inspect(NameArgs),

    /// List all membranes.
    List,

    /// Temporarily widen a membrane's limits.
    Stretch(StretchArgs),

    /// Restore limits from before the first stretch.
    Contract(NameArgs),

    /// Remove an empty membrane.
    Destroy(NameArgs),

    /// Launch a command inside a membrane.
    Run(RunArgs),

    /// Send SIGTERM to a service and forget its process.
    Stop(NameArgs),
}

/// A single service name.
#[derive(Debug, Args)]
pub struct NameArgs {
    /// Service name.
    pub name: String,
}

/// Arguments for `octantctl membrane create`.
#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Service name.
    pub name: String,

    /// Vertex id (`V100`, `v100` or `100`).
    pub vertex: Vertex,

    /// Soft memory limit (`64M`, `1G`, ...).
    #[arg(long, value_parser = parse_bytes)]
    pub memory_soft: Option<u64>,

    /// Hard memory limit (`256M`, `2G`, ...).
    #[arg(long, value_parser = parse_bytes)]
    pub memory_hard: Option<u64>,

    /// CPU weight (1-10000).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    pub cpu: Option<u32>,

    /// Maximum number of tasks.
    #[arg(long)]
    pub pids: Option<u32>,

    /// Capability to keep; repeat to keep several. Replaces the vertex
    /// default set.
    #[arg(long = "capability", value_name = "CAP")]
    pub capabilities: Vec<String>,
}

impl CreateArgs {
    fn overrides(&self) -> LimitOverrides {
        LimitOverrides {
            memory_soft: self.memory_soft,
            memory_hard: self.memory_hard,
            cpu_weight: self.cpu,
            pids_max: self.pids,
            capabilities: (!self.capabilities.is_empty()).then(|| self.capabilities.clone()),
        }
    }
}

/// Arguments for `octantctl membrane stretch`.
#[derive(Debug, Args)]
pub struct StretchArgs {
    /// Service name.
    pub name: String,

    /// New hard memory limit.
    #[arg(long, value_parser = parse_bytes)]
    pub memory: Option<u64>,

    /// New CPU weight.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    pub cpu: Option<u32>,
}

/// Arguments for `octantctl membrane run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Service name.
    pub name: String,

    /// Vertex for a membrane that does not exist yet.
    pub vertex: Vertex,

    /// Command and arguments, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

fn parse_bytes(s: &str) -> Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

/// Runs a membrane command.
pub fn run_membrane(cmd: &MembraneCommand, ctx: &Context) -> u8 {
    match &cmd.subcommand {
        MembraneSubcommand::Create(args) => run_create(args, ctx),
        MembraneSubcommand::Inspect(args) => run_inspect(&args.name, ctx),
        MembraneSubcommand::List => run_list(ctx),
        MembraneSubcommand::Stretch(args) => run_stretch(args, ctx),
        MembraneSubcommand::Contract(args) => {
            report_change(ctx, "contracted", ctx.membranes.contract(&args.name))
        },
        MembraneSubcommand::Destroy(args) => run_destroy(&args.name, ctx),
        MembraneSubcommand::Run(args) => run_run(args, ctx),
        MembraneSubcommand::Stop(args) => run_stop(&args.name, ctx),
    }
}

fn run_create(args: &CreateArgs, ctx: &Context) -> u8 {
    let result = ctx.membranes.create(&args.name, args.vertex, &args.overrides());
    report_change(ctx, "created", result)
}

fn run_stretch(args: &StretchArgs, ctx: &Context) -> u8 {
    if args.memory.is_none() && args.cpu.is_none() {
        eprintln!("Error: stretch needs --memory and/or --cpu");
        return exit_codes::ERROR;
    }
    let request = StretchRequest {
        memory: args.memory,
        cpu: args.cpu,
    };
    report_change(ctx, "stretched", ctx.membranes.stretch(&args.name, request))
}

fn report_change(ctx: &Context, verb: &str, result: octant_core::Result<MembraneChange>) -> u8 {
    let change = match result {
        Ok(change) => change,
        Err(e) => return output_error(ctx.json, &e),
    };
    let warnings: Vec<_> = change.warning().into_iter().collect();

    if ctx.json {
        print_mutation(&change, &warnings);
        return exit_codes::SUCCESS;
    }

    let d = &change.descriptor;
    let verb = if verb == "created" && !change.created { "updated" } else { verb };
    println!("Membrane '{}' {verb} ({} on {}, tier {})", d.name, d.state, d.vertex, d.tier);
    if change.changes.is_empty() {
        println!("  no limit changes");
    }
    for c in &change.changes {
        println!("  {}", describe_change(c));
    }
    print_warnings(&warnings);
    exit_codes::SUCCESS
}

fn describe_change(change: &LimitChange) -> String {
    if change.limit.starts_with("memory") {
        format!(
            "{}: {} -> {}",
            change.limit,
            format_size(change.from),
            format_size(change.to)
        )
    } else {
        format!("{}: {} -> {}", change.limit, change.from, change.to)
    }
}

fn run_inspect(name: &str, ctx: &Context) -> u8 {
    let inspection = match ctx.membranes.inspect(name) {
        Ok(inspection) => inspection,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&inspection);
    } else {
        print_inspection(&inspection);
    }
    exit_codes::SUCCESS
}

fn print_inspection(inspection: &Inspection) {
    let d = &inspection.descriptor;
    println!("Membrane: {}", d.name);
    println!("  Vertex:       {} ({})", d.vertex, d.vertex.name());
    println!("  Tier:         {}", d.tier);
    println!("  State:        {}", d.state);
    println!(
        "  Memory:       {} soft / {} hard",
        format_size(d.memory_soft),
        format_size(d.memory_hard)
    );
    println!("  CPU weight:   {}", d.cpu_weight);
    println!("  Pids max:     {}", d.pids_max);
    println!(
        "  Capabilities: {}",
        if d.capabilities.is_empty() {
            "none".to_string()
        } else {
            d.capabilities.join(", ")
        }
    );
    if let Some(memory) = d.snapshot.memory_hard {
        println!("  Pre-stretch memory: {}", format_size(memory));
    }
    if let Some(cpu) = d.snapshot.cpu_weight {
        println!("  Pre-stretch CPU:    {cpu}");
    }
    println!("  Created:      {}", d.created_at.to_rfc3339());

    match &inspection.runtime {
        Some(record) => println!(
            "  Process:      pid {} since {}",
            record.pid,
            record.launched_at.to_rfc3339()
        ),
        None => println!("  Process:      none"),
    }
    match &inspection.live {
        LiveStatus::Active(usage) => {
            println!("  Usage:");
            println!("    memory: {}", or_dash(usage.memory_current.map(format_size)));
            println!("    cpu:    {} usec", or_dash(usage.cpu_usage_usec));
            println!("    tasks:  {}", or_dash(usage.pids_current));
        },
        LiveStatus::Inactive { reason } => println!("  Usage:        unavailable ({reason})"),
    }
}

fn run_list(ctx: &Context) -> u8 {
    let descriptors = match ctx.membranes.list() {
        Ok(descriptors) => descriptors,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&descriptors);
        return exit_codes::SUCCESS;
    }
    if descriptors.is_empty() {
        println!("No membranes");
        return exit_codes::SUCCESS;
    }
    print_table(&descriptors);
    exit_codes::SUCCESS
}

fn print_table(descriptors: &[MembraneDescriptor]) {
    println!(
        "{:<20} {:<5} {:<12} {:<10} {:>6} {:>5} {:>6}",
        "NAME", "VTX", "TIER", "STATE", "MEM", "CPU", "PIDS"
    );
    for d in descriptors {
        println!(
            "{:<20} {:<5} {:<12} {:<10} {:>6} {:>5} {:>6}",
            d.name,
            d.vertex,
            d.tier,
            d.state,
            format_size(d.memory_hard),
            d.cpu_weight,
            d.pids_max
        );
    }
}

fn run_destroy(name: &str, ctx: &Context) -> u8 {
    let outcome: DestroyOutcome = match ctx.membranes.destroy(name) {
        Ok(outcome) => outcome,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&outcome);
    } else {
        println!("Membrane '{name}' destroyed");
        if outcome.grouping_removed {
            println!("  cgroup grouping removed");
        }
        if outcome.runtime_removed {
            println!("  stale runtime record removed");
        }
    }
    exit_codes::SUCCESS
}

fn run_run(args: &RunArgs, ctx: &Context) -> u8 {
    let Some((command, rest)) = args.command.split_first() else {
        eprintln!("Error: no command given");
        return exit_codes::ERROR;
    };
    let outcome: RunOutcome = match ctx.membranes.run(&args.name, args.vertex, command, rest) {
        Ok(outcome) => outcome,
        Err(e) => return output_error(ctx.json, &e),
    };
    let warnings = outcome.warnings();

    if ctx.json {
        print_mutation(&outcome, &warnings);
        return exit_codes::SUCCESS;
    }

    if outcome.created {
        println!("Membrane '{}' created on {}", args.name, outcome.record.vertex);
    }
    println!("Started '{}' (pid {})", args.name, outcome.record.pid);
    print_warnings(&warnings);
    exit_codes::SUCCESS
}

fn run_stop(name: &str, ctx: &Context) -> u8 {
    let signalled = match ctx.membranes.stop(name) {
        Ok(signalled) => signalled,
        Err(e) => return output_error(ctx.json, &e),
    };
    if ctx.json {
        print_json(&serde_json::json!({ "name": name, "signalled": signalled }));
    } else if signalled {
        println!("Sent SIGTERM to '{name}'");
    } else {
        println!("'{name}' was not running; record removed");
    }
    exit_codes::SUCCESS
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(subcommand)]
        command: MembraneSubcommand,
    }

    fn parse(args: &[&str]) -> MembraneSubcommand {
        let mut argv = vec!["t"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn create_parses_sizes_and_capabilities() {
        let MembraneSubcommand::Create(args) = parse(&[
            "create",
            "web",
            "V110",
            "--memory-hard",
            "1G",
            "--cpu",
            "200",
            "--capability",
            "CAP_CHOWN",
            "--capability",
            "CAP_SETUID",
        ]) else {
            panic!("expected create");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.memory_hard, Some(1 << 30));
        assert_eq!(overrides.memory_soft, None);
        assert_eq!(overrides.cpu_weight, Some(200));
        assert_eq!(
            overrides.capabilities,
            Some(vec!["CAP_CHOWN".to_string(), "CAP_SETUID".to_string()])
        );
    }

    #[test]
    fn create_without_capabilities_keeps_defaults() {
        let MembraneSubcommand::Create(args) = parse(&["create", "web", "110"]) else {
            panic!("expected create");
        };
        assert_eq!(args.overrides(), LimitOverrides::default());
    }

    #[test]
    fn bad_size_is_rejected() {
        let result = Harness::try_parse_from(["t", "stretch", "web", "--memory", "lots"]);
        assert!(result.is_err());
    }

    #[test]
    fn cpu_weight_out_of_range_is_rejected() {
        let result = Harness::try_parse_from(["t", "stretch", "web", "--cpu", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn run_takes_command_after_separator() {
        let MembraneSubcommand::Run(args) =
            parse(&["run", "job", "V100", "--", "/bin/echo", "-n", "hi"])
        else {
            panic!("expected run");
        };
        assert_eq!(args.vertex, Vertex::V100);
        assert_eq!(args.command, vec!["/bin/echo", "-n", "hi"]);
    }

    #[test]
    fn memory_changes_are_formatted_as_sizes() {
        let change = LimitChange {
            limit: "memory_hard",
            from: 256 << 20,
            to: 1 << 30,
        };
        assert_eq!(describe_change(&change), "memory_hard: 256M -> 1G");
        let change = LimitChange {
            limit: "cpu_weight",
            from: 10,
            to: 50,
        };
        assert_eq!(describe_change(&change), "cpu_weight: 10 -> 50");
    }
}
