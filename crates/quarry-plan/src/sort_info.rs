//! Comparable description of what a Sort node sorts by.

use quarry_core::id::NodeId;
use quarry_core::Result;

use crate::node::NodeKind;
use crate::plan::Plan;

/// How a sort's criteria relate to another sort's criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMatch {
    Unequal,
    /// Shared prefix; the other sort has fewer criteria.
    OtherLessAccurate,
    /// Shared prefix; this sort has fewer criteria.
    OurselvesLessAccurate,
    AllEqual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortCriterion {
    pub setter: NodeId,
    /// Rendered expression (or variable id) the rows are ordered by.
    pub key: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortInformation {
    pub criteria: Vec<SortCriterion>,
    pub is_valid: bool,
    pub is_deterministic: bool,
    pub is_complex: bool,
    pub can_throw: bool,
}

impl Default for SortInformation {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            is_valid: true,
            is_deterministic: true,
            is_complex: false,
            can_throw: false,
        }
    }
}

impl SortInformation {
    /// Describe the sort node `id`. Constant sort keys do not order anything
    /// and are left out of the criteria.
    pub fn of(plan: &Plan, id: NodeId, max_len: usize) -> Result<Self> {
        let mut info = SortInformation::default();
        let NodeKind::Sort { elements, .. } = plan.kind(id)? else {
            info.is_valid = false;
            return Ok(info);
        };

        for element in elements {
            let Some(setter) = plan.get_var_set_by(element.var) else {
                info.is_valid = false;
                break;
            };
            if !plan.is_deterministic(setter)? {
                info.is_deterministic = false;
            }
            let key = match plan.kind(setter)? {
                NodeKind::Calculation { expr, .. } => {
                    if expr.can_throw() {
                        info.can_throw = true;
                    }
                    if expr.is_constant() {
                        continue;
                    }
                    match expr.stringify(max_len) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::trace!(error = %e, "sort criterion too complex to compare");
                            info.is_complex = true;
                            break;
                        }
                    }
                }
                _ => format!("${}", element.var.get()),
            };
            info.criteria.push(SortCriterion {
                setter,
                key,
                ascending: element.ascending,
            });
        }
        Ok(info)
    }

    pub fn is_covered_by(&self, other: &SortInformation) -> SortMatch {
        if !self.is_valid || !other.is_valid || self.is_complex || other.is_complex {
            return SortMatch::Unequal;
        }
        for (i, ours) in self.criteria.iter().enumerate() {
            let Some(theirs) = other.criteria.get(i) else {
                return SortMatch::OtherLessAccurate;
            };
            if ours.ascending != theirs.ascending || ours.key != theirs.key {
                return SortMatch::Unequal;
            }
        }
        if other.criteria.len() > self.criteria.len() {
            SortMatch::OurselvesLessAccurate
        } else {
            SortMatch::AllEqual
        }
    }
}
