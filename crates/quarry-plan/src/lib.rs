#![forbid(unsafe_code)]
//! quarry-plan: the execution plan graph the optimizer rewrites.
//!
//! - `node`: the closed catalog of node kinds and their per-kind contracts
//! - `plan`: the node arena with its graph edits, traversals and cloning
//! - `usage`: variable setters and liveness ("used later")
//! - `cost`: per-node cost estimation
//! - `sort_info`: comparable sort criteria for redundant-sort detection
//! - `catalog`: index/cardinality and topology collaborators
//! - `verify`: structural checks for finished plans
//! - `export`: JSON and text explain output

pub mod catalog;
pub mod cost;
pub mod export;
pub mod node;
pub mod plan;
pub mod sort_info;
pub mod usage;
pub mod verify;

pub use catalog::{
    CollectionInfo, FilterSupport, IndexCatalog, IndexDescriptor, MemoryCatalog, SingleServer,
    SortSupport, Topology,
};
pub use cost::CostEstimate;
pub use node::{
    AggregateFunction, AggregateVar, Collect, CollectionScan, Gather, GatherParallelism,
    GatherSortMode, GroupVar, IndexHint, IndexScan, Modification, ModificationOptions, NodeKind,
    NodeType, PlanNode, SortElement,
};
pub use plan::{ClonedPlan, Plan};
pub use verify::verify_plan;
