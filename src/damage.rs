use crate::model::{Condition, OperationalStatus, ResourceInfo};

/// Decides, after a return, whether a resource must leave circulation.
///
/// The engine applies whatever status comes back; it never judges severity.
pub trait DamageAssessor: Send + Sync {
    fn assess(
        &self,
        resource: &ResourceInfo,
        condition_in: Condition,
        damage_notes: Option<&str>,
    ) -> Option<OperationalStatus>;
}

/// Never takes anything out of circulation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAssessment;

impl DamageAssessor for NoAssessment {
    fn assess(&self, _: &ResourceInfo, _: Condition, _: Option<&str>) -> Option<OperationalStatus> {
        None
    }
}

/// Sends gear to maintenance when it comes back at or below a condition,
/// and retires it at or below another.
#[derive(Debug, Clone, Copy)]
pub struct ConditionThreshold {
    pub maintenance_at: Condition,
    pub retire_at: Option<Condition>,
}

impl Default for ConditionThreshold {
    fn default() -> Self {
        Self {
            maintenance_at: Condition::Poor,
            retire_at: None,
        }
    }
}

impl DamageAssessor for ConditionThreshold {
    fn assess(
        &self,
        _: &ResourceInfo,
        condition_in: Condition,
        _: Option<&str>,
    ) -> Option<OperationalStatus> {
        // Condition orders best to worst.
        if self.retire_at.is_some_and(|c| condition_in >= c) {
            Some(OperationalStatus::Retired)
        } else if condition_in >= self.maintenance_at {
            Some(OperationalStatus::Maintenance)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use ulid::Ulid;

    #[test]
    fn threshold_grades_conditions() {
        let info = ResourceInfo::new(Ulid::new(), ResourceKind::Equipment);
        let t = ConditionThreshold {
            maintenance_at: Condition::Poor,
            retire_at: Some(Condition::Damaged),
        };
        assert_eq!(t.assess(&info, Condition::Good, None), None);
        assert_eq!(t.assess(&info, Condition::Fair, None), None);
        assert_eq!(
            t.assess(&info, Condition::Poor, Some("dented")),
            Some(OperationalStatus::Maintenance)
        );
        assert_eq!(
            t.assess(&info, Condition::Damaged, None),
            Some(OperationalStatus::Retired)
        );
        assert_eq!(NoAssessment.assess(&info, Condition::Damaged, None), None);
    }
}
