//! The synthetic `python` requirement and candidate that thread the target
//! interpreter range through the resolution.

use crate::types::{
    Candidate, NamedRequirement, PySpecSet, Requirement, RequirementCore, Specifiers,
};

/// The identifier the synthetic interpreter requirement is collated by. Its
/// preference sorts first, so the python criterion is always resolved before
/// any package.
pub const PYTHON_IDENTIFIER: &str = "python";

/// Builds the synthetic requirement carrying a python version set. The set
/// rides in the `requires_python` slot so the provider can run set algebra
/// on it directly.
pub fn python_requirement(spec: PySpecSet) -> Requirement {
    let specifier: Specifiers = if spec.is_allow_all() || spec.is_impossible() {
        Specifiers::default()
    } else {
        spec.to_string()
            .parse()
            .expect("a rendered python spec parses back")
    };
    let core = RequirementCore {
        name: Some("python".parse().expect("static name parses")),
        specifier,
        requires_python: spec,
        ..Default::default()
    };
    Requirement::Named(NamedRequirement { core })
}

/// Wraps a python requirement into its (only possible) candidate.
pub fn python_candidate(requirement: &Requirement) -> Candidate {
    let name = requirement.name().cloned().expect("python requirement is named");
    Candidate::pinned(requirement.clone(), name, None)
}

/// Whether a requirement is the synthetic python requirement.
pub fn is_python_requirement(requirement: &Requirement) -> bool {
    requirement.identify() == PYTHON_IDENTIFIER
}

/// The matches for the python identifier. The first requirement comes from
/// the project; every later one must be a superset of it, otherwise some
/// pinned package demands interpreters the project does not promise and
/// there is no match.
pub fn find_python_matches(requirements: &[Requirement]) -> Vec<Candidate> {
    let Some(project_req) = requirements.first() else {
        return Vec::new();
    };
    let project_spec = &project_req.core().requires_python;
    if requirements[1..]
        .iter()
        .all(|req| req.core().requires_python.is_superset(project_spec))
    {
        vec![python_candidate(project_req)]
    } else {
        Vec::new()
    }
}

/// Whether a python candidate satisfies a python requirement: the
/// requirement's range must contain the candidate's whole range.
pub fn is_python_satisfied_by(requirement: &Requirement, candidate: &Candidate) -> bool {
    requirement
        .core()
        .requires_python
        .is_superset(&candidate.req.core().requires_python)
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(s: &str) -> PySpecSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_python_matches() {
        let project = python_requirement(spec(">=3.6"));
        let narrowing = python_requirement(spec(">=3.5"));
        let matches = find_python_matches(&[project.clone(), narrowing]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].identify(), PYTHON_IDENTIFIER);

        // a conflicting requires-python yields no match
        let conflicting = python_requirement(spec(">=3.8"));
        assert!(find_python_matches(&[project, conflicting]).is_empty());
    }

    #[test]
    fn test_python_satisfaction() {
        let wide = python_requirement(spec(">=3.5"));
        let narrow = python_requirement(spec(">=3.6"));
        let candidate = python_candidate(&narrow);
        assert!(is_python_satisfied_by(&wide, &candidate));
        let narrower = python_requirement(spec(">=3.8"));
        assert!(!is_python_satisfied_by(&narrower, &candidate));
    }
}
