// Job Graph Builder
// Builds a validated DAG of jobs from a pipeline definition for execution ordering

use crate::definition::{DefinitionError, Job, PipelineDefinition};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

/// Validated dependency graph of the jobs in a pipeline definition
#[derive(Debug, Clone)]
pub struct JobGraph {
    /// Nodes in declaration order
    nodes: Vec<JobNode>,
    /// Quick lookup of node index by job name
    indices: HashMap<String, usize>,
    /// Declaration indices in topological order
    order: Vec<usize>,
}

/// A node representing a job in the graph
#[derive(Debug, Clone)]
pub struct JobNode {
    /// Job definition
    pub job: Arc<Job>,
    /// Position of the job in the definition
    pub index: usize,
    /// Indices of jobs this job needs
    pub dependencies: Vec<usize>,
    /// Indices of jobs that need this job
    pub dependents: Vec<usize>,
}

impl JobNode {
    pub fn name(&self) -> &str {
        &self.job.name
    }
}

impl JobGraph {
    /// Build the graph, failing on duplicate names, unknown dependencies and cycles
    pub fn build(definition: &PipelineDefinition) -> Result<Self, DefinitionError> {
        let mut indices = HashMap::with_capacity(definition.jobs.len());
        for (i, job) in definition.jobs.iter().enumerate() {
            if indices.insert(job.name.clone(), i).is_some() {
                return Err(DefinitionError::duplicate_job(&job.name));
            }
        }

        let mut nodes: Vec<JobNode> = definition
            .jobs
            .iter()
            .enumerate()
            .map(|(i, job)| JobNode {
                job: Arc::new(job.clone()),
                index: i,
                dependencies: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (i, job) in definition.jobs.iter().enumerate() {
            for dep in &job.needs {
                let dep_index = *indices
                    .get(dep)
                    .ok_or_else(|| DefinitionError::unknown_dependency(&job.name, dep))?;

                // `needs: [a, a]` is one edge
                if !nodes[i].dependencies.contains(&dep_index) {
                    nodes[i].dependencies.push(dep_index);
                    nodes[dep_index].dependents.push(i);
                }
            }
        }

        let order = Self::kahn_order(&nodes);
        if order.len() < nodes.len() {
            let mut resolved = vec![false; nodes.len()];
            for &i in &order {
                resolved[i] = true;
            }
            let unresolved: Vec<&str> = nodes
                .iter()
                .filter(|n| !resolved[n.index])
                .map(JobNode::name)
                .collect();
            return Err(DefinitionError::cyclic(&unresolved));
        }

        Ok(Self {
            nodes,
            indices,
            order,
        })
    }

    /// Kahn's algorithm. Among jobs that are available at the same time the
    /// one declared first wins, so the order is the same on every build.
    fn kahn_order(nodes: &[JobNode]) -> Vec<usize> {
        let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();

        let mut available: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse(i)) = available.pop() {
            order.push(i);
            for &dependent in &nodes[i].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    available.push(Reverse(dependent));
                }
            }
        }

        order
    }

    /// Jobs in a stable topological order
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&i| &self.nodes[i]).collect()
    }

    /// Group jobs into layers that can run in parallel
    pub fn levels(&self) -> Vec<Vec<&JobNode>> {
        let mut levels: Vec<Vec<&JobNode>> = Vec::new();
        let mut assigned = vec![0usize; self.nodes.len()];

        for &i in &self.order {
            let node = &self.nodes[i];
            let level = node
                .dependencies
                .iter()
                .map(|&dep| assigned[dep] + 1)
                .max()
                .unwrap_or(0);

            assigned[i] = level;

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(node);
        }

        levels
    }

    pub fn get(&self, name: &str) -> Option<&JobNode> {
        self.indices.get(name).map(|&i| &self.nodes[i])
    }

    /// Jobs that directly need the named job
    pub fn dependents(&self, name: &str) -> Vec<&JobNode> {
        self.get(name)
            .map(|node| node.dependents.iter().map(|&i| &self.nodes[i]).collect())
            .unwrap_or_default()
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionErrorKind, Step};

    fn make_job(name: &str, needs: &[&str]) -> Job {
        Job::new(name)
            .with_needs(needs.iter().copied())
            .with_step(Step::script("true"))
    }

    fn make_definition(jobs: Vec<Job>) -> PipelineDefinition {
        jobs.into_iter()
            .fold(PipelineDefinition::new("test"), |def, job| def.with_job(job))
    }

    fn names(nodes: &[&JobNode]) -> Vec<String> {
        nodes.iter().map(|n| n.name().to_string()).collect()
    }

    #[test]
    fn test_independent_jobs_keep_declaration_order() {
        let def = make_definition(vec![
            make_job("format", &[]),
            make_job("lint", &[]),
            make_job("test", &[]),
        ]);

        let graph = JobGraph::build(&def).unwrap();
        assert_eq!(names(&graph.topological_order()), vec!["format", "lint", "test"]);
        assert_eq!(graph.levels().len(), 1);
    }

    #[test]
    fn test_linear_chain() {
        let def = make_definition(vec![
            make_job("deploy", &["test"]),
            make_job("test", &["build"]),
            make_job("build", &[]),
        ]);

        let graph = JobGraph::build(&def).unwrap();
        assert_eq!(names(&graph.topological_order()), vec!["build", "test", "deploy"]);

        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(names(&levels[2]), vec!["deploy"]);
        assert_eq!(names(&graph.dependents("build")), vec!["test"]);
    }

    #[test]
    fn test_order_is_stable_across_builds() {
        let def = make_definition(vec![
            make_job("e", &["b", "c"]),
            make_job("c", &["a"]),
            make_job("b", &["a"]),
            make_job("d", &[]),
            make_job("a", &[]),
        ]);

        let first = names(&JobGraph::build(&def).unwrap().topological_order());
        assert_eq!(first, vec!["d", "a", "c", "b", "e"]);

        for _ in 0..20 {
            let again = names(&JobGraph::build(&def).unwrap().topological_order());
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_diamond_levels() {
        let def = make_definition(vec![
            make_job("build", &[]),
            make_job("unit", &["build"]),
            make_job("integration", &["build"]),
            make_job("release", &["unit", "integration"]),
        ]);

        let graph = JobGraph::build(&def).unwrap();
        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(names(&levels[1]), vec!["unit", "integration"]);
        assert_eq!(graph.get("release").unwrap().dependencies, vec![1, 2]);
    }

    #[test]
    fn test_cycle_detection() {
        let def = make_definition(vec![
            make_job("ok", &[]),
            make_job("a", &["c"]),
            make_job("b", &["a"]),
            make_job("c", &["b"]),
        ]);

        let err = JobGraph::build(&def).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::CyclicDependency);
        assert!(err.message.ends_with("a, b, c"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = make_definition(vec![make_job("a", &["a"])]);
        let err = JobGraph::build(&def).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::CyclicDependency);
    }

    #[test]
    fn test_unknown_dependency() {
        let def = make_definition(vec![make_job("test", &["build"])]);
        let err = JobGraph::build(&def).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::UnknownDependency);
    }

    #[test]
    fn test_duplicate_job() {
        let def = make_definition(vec![make_job("build", &[]), make_job("build", &[])]);
        let err = JobGraph::build(&def).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::DuplicateJob);
    }

    #[test]
    fn test_repeated_need_is_one_edge() {
        let def = make_definition(vec![make_job("a", &[]), make_job("b", &["a", "a"])]);
        let graph = JobGraph::build(&def).unwrap();
        assert_eq!(graph.get("b").unwrap().dependencies, vec![0]);
        assert_eq!(graph.get("a").unwrap().dependents, vec![1]);
    }
}
