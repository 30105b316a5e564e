//! `octantctl vertex` - read-only vertex queries.
//!
//! - `octantctl vertex list` - the eight compiled-in profiles
//! - `octantctl vertex status` - per-vertex state, membranes and services
//! - `octantctl vertex inspect <id>` - one profile with its neighbors

use clap::{Args, Subcommand};
use octant_core::Vertex;
use octant_core::size::format_size;
use octant_core::store::{MembraneDescriptor, RuntimeRecord, VertexState};
use serde::Serialize;

use super::{Context, exit_codes, or_dash, output_error, print_json};

/// Vertex command group.
#[derive(Debug, Args)]
pub struct VertexCommand {
    #[command(subcommand)]
    pub subcommand: VertexSubcommand,
}

/// Vertex subcommands.
#[derive(Debug, Subcommand)]
pub enum VertexSubcommand {
    /// List the eight vertex profiles.
    List,

    /// Show each vertex's state with its membranes and running services.
    Status,

    /// Show one vertex profile in detail.
    Inspect(InspectArgs),
}

/// Arguments for `octantctl vertex inspect`.
#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Vertex id (`V101`, `v101` or `101`).
    pub vertex: Vertex,
}

/// Serializable view of a vertex profile.
#[derive(Debug, Clone, Serialize)]
pub struct VertexView {
    pub id: Vertex,
    pub name: &'static str,
    pub visibility: &'static str,
    pub weight: &'static str,
    pub polarity: octant_core::Chirality,
    pub tier: Option<&'static str>,
    pub memory_soft: Option<u64>,
    pub memory_hard: Option<u64>,
    pub cpu_weight: Option<u32>,
    pub pids_max: Option<u32>,
    pub namespaces: Vec<&'static str>,
    pub capabilities: Vec<&'static str>,
    pub partner: Vertex,
    pub visibility_neighbor: Vertex,
    pub weight_neighbor: Vertex,
}

impl From<Vertex> for VertexView {
    fn from(vertex: Vertex) -> Self {
        let profile = vertex.profile();
        let envelope = profile.envelope;
        let neighbors = vertex.neighbors();
        Self {
            id: vertex,
            name: profile.name,
            visibility: if vertex.is_user() { "user" } else { "kernel" },
            weight: if vertex.is_heavy() { "heavyweight" } else { "lightweight" },
            polarity: vertex.polarity(),
            tier: profile.tier,
            memory_soft: envelope.map(|e| e.memory_soft),
            memory_hard: envelope.map(|e| e.memory_hard),
            cpu_weight: envelope.map(|e| e.cpu_weight),
            pids_max: envelope.map(|e| e.pids_max),
            namespaces: profile.isolation.namespaces(),
            capabilities: profile.capabilities.to_vec(),
            partner: vertex.partner(),
            visibility_neighbor: neighbors.visibility,
            weight_neighbor: neighbors.weight,
        }
    }
}

/// One row of `vertex status`.
#[derive(Debug, Clone, Serialize)]
pub struct VertexStatusRow {
    pub vertex: Vertex,
    pub name: &'static str,
    pub state: VertexState,
    pub membranes: Vec<String>,
    pub running: Vec<String>,
}

fn status_rows(
    table: &octant_core::store::VertexTable,
    membranes: &[MembraneDescriptor],
    runtimes: &[RuntimeRecord],
) -> Vec<VertexStatusRow> {
    Vertex::ALL
        .into_iter()
        .map(|vertex| VertexStatusRow {
            vertex,
            name: vertex.name(),
            state: table.get(vertex),
            membranes: membranes
                .iter()
                .filter(|d| d.vertex == vertex)
                .map(|d| d.name.clone())
                .collect(),
            running: runtimes
                .iter()
                .filter(|r| r.vertex == vertex)
                .map(|r| r.name.clone())
                .collect(),
        })
        .collect()
}

/// Runs a vertex command.
pub fn run_vertex(cmd: &VertexCommand, ctx: &Context) -> u8 {
    match &cmd.subcommand {
        VertexSubcommand::List => run_list(ctx.json),
        VertexSubcommand::Status => run_status(ctx),
        VertexSubcommand::Inspect(args) => run_inspect(args, ctx),
    }
}

fn run_list(json_output: bool) -> u8 {
    let views: Vec<VertexView> = Vertex::ALL.into_iter().map(VertexView::from).collect();
    if json_output {
        print_json(&views);
        return exit_codes::SUCCESS;
    }

    println!(
        "{:<5} {:<12} {:<12} {:>6} {:>6} {:>4} {:>5}  NAMESPACES",
        "ID", "NAME", "TIER", "SOFT", "HARD", "CPU", "PIDS"
    );
    for view in &views {
        println!(
            "{:<5} {:<12} {:<12} {:>6} {:>6} {:>4} {:>5}  {}",
            view.id,
            view.name,
            view.tier.unwrap_or("-"),
            or_dash(view.memory_soft.map(format_size)),
            or_dash(view.memory_hard.map(format_size)),
            or_dash(view.cpu_weight),
            or_dash(view.pids_max),
            if view.namespaces.is_empty() {
                "-".to_string()
            } else {
                view.namespaces.join(",")
            },
        );
    }
    exit_codes::SUCCESS
}

fn run_status(ctx: &Context) -> u8 {
    let store = ctx.membranes.store();
    let loaded = store.vertex_table().and_then(|table| {
        Ok((table, store.membranes()?, store.runtimes()?, store.mode()?))
    });
    let (table, membranes, runtimes, mode) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => return output_error(ctx.json, &e.into()),
    };
    let rows = status_rows(&table, &membranes, &runtimes);

    if ctx.json {
        print_json(&serde_json::json!({ "mode": mode, "vertices": rows }));
        return exit_codes::SUCCESS;
    }

    println!("Mode: {mode}");
    println!("{:<5} {:<12} {:<9} {:>9}  RUNNING", "ID", "NAME", "STATE", "MEMBRANES");
    for row in &rows {
        println!(
            "{:<5} {:<12} {:<9} {:>9}  {}",
            row.vertex,
            row.name,
            row.state,
            row.membranes.len(),
            if row.running.is_empty() {
                "-".to_string()
            } else {
                row.running.join(",")
            },
        );
    }
    exit_codes::SUCCESS
}

fn run_inspect(args: &InspectArgs, ctx: &Context) -> u8 {
    let view = VertexView::from(args.vertex);
    let state = match ctx.membranes.store().vertex_table() {
        Ok(table) => table.get(args.vertex),
        Err(e) => return output_error(ctx.json, &e.into()),
    };

    if ctx.json {
        print_json(&serde_json::json!({ "profile": view, "state": state }));
        return exit_codes::SUCCESS;
    }

    println!("Vertex {} ({})", view.id, view.name);
    println!("  State:        {state}");
    println!("  Class:        {}, {}, {}", view.visibility, view.weight, view.polarity);
    println!("  Tier:         {}", view.tier.unwrap_or("none (no enforceable boundary)"));
    if let (Some(soft), Some(hard)) = (view.memory_soft, view.memory_hard) {
        println!("  Memory:       {} soft / {} hard", format_size(soft), format_size(hard));
    }
    println!("  CPU weight:   {}", or_dash(view.cpu_weight));
    println!("  Pids max:     {}", or_dash(view.pids_max));
    println!(
        "  Namespaces:   {}",
        if view.namespaces.is_empty() {
            "none".to_string()
        } else {
            view.namespaces.join(", ")
        }
    );
    println!(
        "  Capabilities: {}",
        if view.capabilities.is_empty() {
            "none".to_string()
        } else {
            view.capabilities.join(", ")
        }
    );
    println!("  Partner:      {}", view.partner);
    println!(
        "  Neighbors:    {} (visibility), {} (weight)",
        view.visibility_neighbor, view.weight_neighbor
    );
    exit_codes::SUCCESS
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use octant_core::Chirality;
    use octant_core::store::VertexTable;

    use super::*;

    #[test]
    fn view_of_kernel_vertex_has_no_limits() {
        let view = VertexView::from(Vertex::V000);
        assert_eq!(view.name, "Proton");
        assert_eq!(view.visibility, "kernel");
        assert!(view.tier.is_none());
        assert!(view.memory_hard.is_none());
        assert_eq!(view.partner, Vertex::V001);
    }

    #[test]
    fn view_of_dark_photon() {
        let view = VertexView::from(Vertex::V101);
        assert_eq!(view.tier, Some("darkphoton"));
        assert_eq!(view.memory_hard, Some(256 << 20));
        assert_eq!(view.polarity, Chirality::Development);
        assert_eq!(view.namespaces, vec!["pid", "net", "mount", "uts", "ipc"]);
        assert_eq!(view.weight_neighbor, Vertex::V111);
        assert_eq!(view.visibility_neighbor, Vertex::V001);
    }

    #[test]
    fn status_groups_membranes_and_services_by_vertex() {
        let table = VertexTable::initial(Chirality::Production);
        let runtime = RuntimeRecord {
            name: "dns".to_string(),
            vertex: Vertex::V100,
            pid: 1,
            start_time: None,
            launched_at: Utc::now(),
        };
        let rows = status_rows(&table, &[], &[runtime]);
        assert_eq!(rows.len(), 8);
        let photon = &rows[4];
        assert_eq!(photon.vertex, Vertex::V100);
        assert_eq!(photon.running, vec!["dns"]);
        assert!(photon.membranes.is_empty());
    }
}
