use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{DefinitionParser, JobGraph};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Validating", &format!("{}", pipeline_path.display()));

    // Step 1: Parse and check the schema
    let definition = match DefinitionParser::from_file(pipeline_path) {
        Ok(def) => def,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check(&format!(
        "Structure: {} jobs, {} steps",
        definition.jobs.len(),
        definition.total_steps()
    ));

    let triggers: Vec<String> = definition
        .trigger
        .events()
        .map(|(kind, _)| kind.to_string())
        .collect();
    if triggers.is_empty() {
        output::check("Triggers: any event");
    } else {
        output::check(&format!("Triggers: {}", triggers.join(", ")));
    }

    // Step 2: Dependency graph
    let graph = match JobGraph::build(&definition) {
        Ok(graph) => graph,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check("Dependency graph is acyclic");

    println!();
    output::header("Execution order");
    for (i, node) in graph.topological_order().into_iter().enumerate() {
        let needs = if node.job.needs.is_empty() {
            String::new()
        } else {
            format!(" (needs: {})", node.job.needs.join(", "))
        };
        println!("  {}. {}{}", i + 1, node.name(), needs);
    }

    println!();
    output::header("Parallel levels");
    for (i, level) in graph.levels().into_iter().enumerate() {
        let names: Vec<&str> = level.iter().map(|n| n.name()).collect();
        println!("  {}: {}", i + 1, names.join(", "));
    }

    println!();
    output::success(&format!("Pipeline '{}' is valid", definition.name));

    Ok(())
}
