//! Static routing table for the state machine.
//!
//! Every node has a declared successor set; the engine refuses any
//! transition outside it (fail-closed) instead of trusting node code.
//! The table is total over [`NodeKind::ALL`] and checked once at engine
//! construction.

use crate::types::NodeKind;

/// Entry node for every query.
pub const ENTRY: NodeKind = NodeKind::Understand;

/// Declared successors for a node. Terminal nodes return an empty slice.
#[must_use]
pub fn successors(node: NodeKind) -> &'static [NodeKind] {
    use NodeKind::*;
    match node {
        Understand => &[RetrieveContext, Error],
        RetrieveContext => &[Decompose],
        // Multi-part queries skip the hypothesis loop and enter SQL
        // generation for their first sub-query.
        Decompose => &[GenerateHypothesis, GenerateSql],
        GenerateHypothesis => &[GenerateSql, Error],
        GenerateSql => &[Validate, Error],
        // Every query pauses for HITL review after validation.
        Validate => &[AwaitApproval, Error],
        ProbeSql => &[Execute, RepairSql, Error],
        AwaitApproval => &[Execute, ProbeSql, Error],
        // GenerateSql is the sub-query advancement edge: a completed
        // sub-query hands the cursor to the next one.
        Execute => &[
            ValidateResults,
            RepairSql,
            GenerateFallbackSql,
            FormatResults,
            GenerateSql,
            Error,
        ],
        ValidateResults => &[FormatResults, PivotStrategy],
        PivotStrategy => &[GenerateHypothesis, FormatResults],
        RepairSql => &[Validate, Error],
        // FormatResults is the cap-overflow exit when partial output exists.
        GenerateFallbackSql => &[Validate, FormatResults, Error],
        FormatResults => &[],
        Error => &[],
    }
}

/// Whether `from → to` is a declared transition.
#[must_use]
pub fn is_allowed(from: NodeKind, to: NodeKind) -> bool {
    successors(from).contains(&to)
}

/// Nodes that end the pipeline.
#[must_use]
pub fn is_terminal_node(node: NodeKind) -> bool {
    successors(node).is_empty()
}

/// Validate the table at startup: totality plus the structural rules the
/// engine relies on. Returns the offending node on failure.
pub fn validate_table() -> Result<(), NodeKind> {
    for node in NodeKind::ALL {
        let successors = successors(node);
        match node {
            NodeKind::FormatResults | NodeKind::Error => {
                if !successors.is_empty() {
                    return Err(node);
                }
            }
            _ => {
                if successors.is_empty() {
                    return Err(node);
                }
            }
        }
        // Self-loops would defeat the loop caps.
        if successors.contains(&node) {
            return Err(node);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_valid() {
        assert_eq!(validate_table(), Ok(()));
    }

    #[test]
    fn validate_always_routes_to_approval() {
        assert!(is_allowed(NodeKind::Validate, NodeKind::AwaitApproval));
        assert!(!is_allowed(NodeKind::Validate, NodeKind::Execute));
    }

    #[test]
    fn unknown_transitions_are_rejected() {
        assert!(!is_allowed(NodeKind::Understand, NodeKind::Execute));
        assert!(!is_allowed(NodeKind::FormatResults, NodeKind::Understand));
    }

    #[test]
    fn repair_loops_back_to_validate() {
        assert!(is_allowed(NodeKind::RepairSql, NodeKind::Validate));
        assert!(is_allowed(NodeKind::GenerateFallbackSql, NodeKind::Validate));
    }

    #[test]
    fn cap_overflow_exit_is_declared() {
        assert!(is_allowed(
            NodeKind::GenerateFallbackSql,
            NodeKind::FormatResults
        ));
    }

    #[test]
    fn sub_query_loop_goes_through_the_full_gate() {
        // Decomposed sub-queries enter at SQL generation and loop back
        // there from execute; validation and approval sit in between.
        assert!(is_allowed(NodeKind::Decompose, NodeKind::GenerateSql));
        assert!(is_allowed(NodeKind::Execute, NodeKind::GenerateSql));
        assert!(!is_allowed(NodeKind::Decompose, NodeKind::Execute));
        assert!(!is_allowed(NodeKind::Decompose, NodeKind::FormatResults));
    }
}
