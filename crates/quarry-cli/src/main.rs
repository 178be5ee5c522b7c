//! quarry CLI: optimize and explain YAML queries.

use clap::{Parser, Subcommand};
use quarry_core::prelude::{OptimizerConfig, VariableRegistry};
use quarry_optimizer::Optimizer;
use quarry_plan::export::{explain, render_text};
use quarry_plan::MemoryCatalog;
use quarry_planner::{build_plan, parse_yaml_query};
use quarry_rules::RuleCatalog;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Rule-based query plan optimizer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a query and print the selected plan
    Explain {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// Path to the catalog YAML file (collections, indexes, shards)
        #[arg(short, long)]
        catalog: Option<PathBuf>,

        /// Candidate plan cap (overrides QUARRY_MAX_CANDIDATE_PLANS)
        #[arg(long)]
        max_plans: Option<usize>,

        /// Rule to disable; `all` disables every optional rule
        #[arg(long = "disable")]
        disabled: Vec<String>,

        /// Rule to run even if disabled
        #[arg(long = "force")]
        forced: Vec<String>,

        /// Run mandatory and forced rules only
        #[arg(long)]
        required_only: bool,

        /// Print the plan as JSON for the execution engine
        #[arg(long)]
        json: bool,
    },

    /// Parse a query and build its initial plan without optimizing it
    Validate {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// Path to the catalog YAML file
        #[arg(short, long)]
        catalog: Option<PathBuf>,
    },

    /// List the optimizer rules with their levels and flags
    Rules,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Explain {
            query,
            catalog,
            max_plans,
            disabled,
            forced,
            required_only,
            json,
        } => {
            let config = build_config(
                OptimizerConfig::from_env(),
                max_plans,
                disabled,
                forced,
                required_only,
            );
            explain_query(&query, catalog.as_deref(), config, json)
        }
        Commands::Validate { query, catalog } => validate_query(&query, catalog.as_deref()),
        Commands::Rules => {
            list_rules();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Command-line flags take precedence over the environment.
fn build_config(
    mut config: OptimizerConfig,
    max_plans: Option<usize>,
    disabled: Vec<String>,
    forced: Vec<String>,
    required_only: bool,
) -> OptimizerConfig {
    if let Some(max) = max_plans {
        config.max_candidate_plans = max;
    }
    config.disabled_rules.extend(disabled);
    config.forced_rules.extend(forced);
    config.required_rules_only |= required_only;
    config
}

fn load_catalog(path: Option<&Path>) -> Result<MemoryCatalog, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(MemoryCatalog::from_yaml_str(&fs::read_to_string(p)?)?),
        None => Ok(MemoryCatalog::new()),
    }
}

fn explain_query(
    query_path: &Path,
    catalog_path: Option<&Path>,
    config: OptimizerConfig,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = load_catalog(catalog_path)?;
    let query = parse_yaml_query(&fs::read_to_string(query_path)?)?;

    let mut vars = VariableRegistry::new();
    let plan = build_plan(&query, &mut vars, &catalog)?;
    let optimizer = Optimizer::new(RuleCatalog::default(), config)?;
    let result = optimizer.optimize(plan, &mut vars, &catalog, &catalog)?;
    let costs = &optimizer.config().costs;

    if json {
        let doc = explain(&result.plan, &vars, costs)?;
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Execution plan");
    println!("==============");
    print!("{}", render_text(&result.plan, &vars, costs)?);
    println!();
    println!("Estimated cost: {:.2}", result.cost.cpu);
    println!("Estimated rows: {}", result.cost.rows);
    println!(
        "Candidates: {} created, {} surviving{}",
        result.stats.plans_created,
        result.stats.surviving_candidates,
        if result.stats.required_only {
            " (required rules only)"
        } else {
            ""
        }
    );
    println!(
        "Rule invocations: {} ({} skipped, {} reruns)",
        result.stats.rule_invocations, result.stats.rules_skipped, result.stats.reruns
    );
    Ok(())
}

fn validate_query(
    query_path: &Path,
    catalog_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = load_catalog(catalog_path)?;
    let query = parse_yaml_query(&fs::read_to_string(query_path)?)?;
    let mut vars = VariableRegistry::new();
    let plan = build_plan(&query, &mut vars, &catalog)?;
    quarry_plan::verify_plan(&plan)?;
    println!("✓ Query is valid ({} nodes, {} variables)", plan.len(), vars.len());
    Ok(())
}

fn list_rules() {
    let catalog = RuleCatalog::default();
    println!("{:>5}  {:<40} flags", "level", "rule");
    for rule in catalog.iter() {
        let f = &rule.flags;
        let mut flags = Vec::new();
        if !f.can_be_disabled {
            flags.push("mandatory");
        }
        if f.cluster_only {
            flags.push("cluster-only");
        }
        if f.can_create_additional_plans {
            flags.push("creates-plans");
        }
        if f.fixed_point {
            flags.push("fixed-point");
        }
        if f.disabled_by_default {
            flags.push("off-by-default");
        }
        println!("{:>5}  {:<40} {}", rule.level, rule.name, flags.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::build_config;
    use quarry_core::OptimizerConfig;

    #[test]
    fn flags_override_environment_config() {
        let mut env = OptimizerConfig::default().disable("split-filters");
        env.max_candidate_plans = 7;
        let cfg = build_config(
            env,
            Some(2),
            vec!["use-indexes".into()],
            vec!["sort-limit".into()],
            true,
        );
        assert_eq!(cfg.max_candidate_plans, 2);
        assert!(cfg.is_disabled("split-filters"));
        assert!(cfg.is_disabled("use-indexes"));
        assert!(cfg.is_forced("sort-limit"));
        assert!(cfg.required_rules_only);
    }

    #[test]
    fn environment_config_survives_without_flags() {
        let mut env = OptimizerConfig::default();
        env.max_candidate_plans = 7;
        let cfg = build_config(env, None, Vec::new(), Vec::new(), false);
        assert_eq!(cfg.max_candidate_plans, 7);
        assert!(!cfg.required_rules_only);
    }
}
