//! The backtracking resolution engine: a sequential state machine over
//! criteria, pins, and backjumps. All knowledge about packages comes in
//! through the [`Provider`] protocol; the engine itself only merges
//! requirements, picks identifiers by preference, and walks back out of
//! conflicts.

use super::reporter::Reporter;
use crate::types::{Candidate, Requirement};
use crate::utils::LazySequence;
use indexmap::IndexMap;
use miette::Diagnostic;
use std::collections::HashSet;
use std::fmt::Display;
use std::rc::Rc;
use thiserror::Error;

/// One requirement together with the pinned candidate that demanded it
/// (`None` for user requirements).
#[derive(Debug, Clone)]
pub struct RequirementInformation {
    /// The requirement itself.
    pub requirement: Requirement,
    /// The dependent that introduced it, if any.
    pub parent: Option<Candidate>,
}

/// The accumulated knowledge about a single identifier: the candidates that
/// may satisfy it, every requirement that constrains it, and the candidates
/// ruled out by backtracking.
pub struct Criterion {
    /// The lazily evaluated candidate view, most preferred first.
    pub candidates: LazySequence<Candidate>,
    /// All requirements collated under this identifier, with their parents.
    pub information: Vec<RequirementInformation>,
    /// Candidates that may not be pinned again.
    pub incompatibilities: Vec<Candidate>,
}

impl Criterion {
    /// Iterates over the requirements constraining this identifier.
    pub fn iter_requirement(&self) -> impl Iterator<Item = &Requirement> {
        self.information.iter().map(|info| &info.requirement)
    }

    /// Iterates over the (optional) parents of the requirements.
    pub fn iter_parent(&self) -> impl Iterator<Item = Option<&Candidate>> {
        self.information.iter().map(|info| info.parent.as_ref())
    }
}

/// The criteria map shared between resolution states. Criteria are
/// immutable once built and replaced wholesale, so states share them.
pub type Criteria = IndexMap<String, Rc<Criterion>>;

/// One element of a preference tuple. Tuples compare lexicographically and
/// the lowest one is resolved next.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreferenceElem {
    /// A boolean component; `false` sorts first.
    Bool(bool),
    /// A signed numeric component.
    Int(i64),
    /// A string component, used as the final tie-breaker.
    Str(String),
}

/// The sortable tuple ordering the resolver's next-identifier choice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Preference(pub Vec<PreferenceElem>);

/// Error raised from provider callbacks.
#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    /// The candidate's dependency information is unusable; the engine
    /// treats this like an empty criterion and backtracks past the
    /// candidate.
    #[error("dependencies of the candidate are unavailable: {0}")]
    DependenciesUnavailable(String),

    /// A hard failure that aborts the resolution.
    #[error("{0}")]
    Fatal(String),

    /// Cooperative cancellation was requested.
    #[error("the resolution was cancelled")]
    Cancelled,
}

/// The protocol the engine drives. Implemented by the provider layer, which
/// wraps a repository with an update strategy.
pub trait Provider {
    /// The merge key of a requirement.
    fn identify_requirement(&self, requirement: &Requirement) -> String {
        requirement.identify()
    }

    /// The merge key of a candidate.
    fn identify_candidate(&self, candidate: &Candidate) -> String {
        candidate.identify()
    }

    /// Ranks `identifier` among the currently unsatisfied identifiers; the
    /// lowest preference is pinned next.
    fn get_preference(
        &self,
        identifier: &str,
        resolutions: &IndexMap<String, Candidate>,
        criteria: &Criteria,
        backtrack_causes: &[RequirementInformation],
    ) -> Preference;

    /// Produces the candidate view for `identifier`. The applicable
    /// requirements are those recorded in `criteria` plus
    /// `extra_requirements`; the excluded candidates are those recorded in
    /// `criteria` plus `extra_incompatibilities`. The returned sequence is
    /// evaluated lazily by the engine.
    fn find_matches(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
        extra_incompatibilities: &[Candidate],
    ) -> Result<LazySequence<Candidate>, ProviderError>;

    /// Whether `candidate` satisfies `requirement`.
    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool;

    /// The dependencies of a pinned candidate.
    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError>;
}

/// Error raised when a resolution cannot complete.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolutionError {
    /// Backtracking exhausted every alternative. Carries the requirements
    /// involved in the final conflict together with their dependents.
    #[error("unable to find a resolution\n{}", format_causes(.causes))]
    Impossible {
        /// The conflicting requirement information.
        causes: Vec<RequirementInformation>,
    },

    /// The round limit was exceeded before reaching a fixed point.
    #[error("resolution exceeded the limit of {0} rounds")]
    TooDeep(usize),

    /// A provider callback failed fatally.
    #[error("{0}")]
    Provider(String),

    /// The resolution was cancelled.
    #[error("the resolution was cancelled")]
    Cancelled,

    /// A provider handed out a candidate that does not satisfy the
    /// requirements it was found for.
    #[error("provider returned an inconsistent candidate for '{identifier}'")]
    InconsistentCandidate {
        /// The identifier being pinned.
        identifier: String,
    },
}

/// Renders each conflicting requirement with the parent that demanded it.
fn format_causes(causes: &[RequirementInformation]) -> String {
    let mut lines = Vec::new();
    for cause in causes {
        match &cause.parent {
            Some(parent) => lines.push(format!(
                "  {} (from {})",
                cause.requirement.as_line(),
                parent
            )),
            None => lines.push(format!("  {} (from project)", cause.requirement.as_line())),
        }
    }
    lines.join("\n")
}

impl From<ProviderError> for ResolutionError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Cancelled => ResolutionError::Cancelled,
            other => ResolutionError::Provider(other.to_string()),
        }
    }
}

/// The outcome of a successful resolution.
pub struct ResolutionResult {
    /// Identifier to pinned candidate.
    pub mapping: IndexMap<String, Candidate>,
    /// The final criteria, carrying the parent/child information the
    /// inheritance passes traverse.
    pub criteria: Criteria,
}

#[derive(Clone)]
struct State {
    mapping: IndexMap<String, Candidate>,
    criteria: Criteria,
    backtrack_causes: Vec<RequirementInformation>,
}

enum AddError {
    /// Merging the requirement produced an empty candidate set.
    Conflicted(Rc<Criterion>),
    Provider(ProviderError),
}

impl From<ProviderError> for AddError {
    fn from(value: ProviderError) -> Self {
        AddError::Provider(value)
    }
}

/// A single resolution run over a provider.
pub struct Resolution<'p> {
    provider: &'p dyn Provider,
    reporter: &'p dyn Reporter,
    states: Vec<State>,
}

impl<'p> Resolution<'p> {
    /// Creates a run over the given provider and reporter.
    pub fn new(provider: &'p dyn Provider, reporter: &'p dyn Reporter) -> Self {
        Resolution {
            provider,
            reporter,
            states: Vec::new(),
        }
    }

    fn state(&self) -> &State {
        self.states.last().expect("resolution has at least one state")
    }

    fn state_mut(&mut self) -> &mut State {
        self.states
            .last_mut()
            .expect("resolution has at least one state")
    }

    fn push_new_state(&mut self) {
        let state = self.state().clone();
        self.states.push(state);
    }

    fn add_to_criteria(
        &self,
        criteria: &mut Criteria,
        requirement: Requirement,
        parent: Option<&Candidate>,
    ) -> Result<(), AddError> {
        let identifier = self.provider.identify_requirement(&requirement);
        let (mut information, incompatibilities) = match criteria.get(&identifier) {
            Some(criterion) => (
                criterion.information.clone(),
                criterion.incompatibilities.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        let matches = self.provider.find_matches(
            &identifier,
            criteria,
            std::slice::from_ref(&requirement),
            &[],
        )?;
        information.push(RequirementInformation {
            requirement,
            parent: parent.cloned(),
        });
        let criterion = Rc::new(Criterion {
            candidates: matches,
            information,
            incompatibilities,
        });
        if criterion.candidates.is_empty() {
            return Err(AddError::Conflicted(criterion));
        }
        criteria.insert(identifier, criterion);
        Ok(())
    }

    fn is_current_pin_satisfying(&self, name: &str, criterion: &Criterion) -> bool {
        let Some(pin) = self.state().mapping.get(name) else {
            return false;
        };
        criterion
            .iter_requirement()
            .all(|r| self.provider.is_satisfied_by(r, pin))
    }

    fn get_updated_criteria(&self, candidate: &Candidate) -> Result<Criteria, AddError> {
        let mut criteria = self.state().criteria.clone();
        for dependency in self
            .provider
            .get_dependencies(candidate)
            .map_err(dependency_failure)?
        {
            self.add_to_criteria(&mut criteria, dependency, Some(candidate))?;
        }
        Ok(criteria)
    }

    /// Tries the candidates of `name` in order; returns the criteria that
    /// ruled each one out, or empty when a pin succeeded.
    fn attempt_to_pin(&mut self, name: &str) -> Result<Vec<Rc<Criterion>>, ResolutionError> {
        let criterion = Rc::clone(&self.state().criteria[name]);
        let mut causes = Vec::new();
        let mut index = 0;
        loop {
            // the candidate view is lazy; stop pulling as soon as one works
            let Some(candidate) = criterion.candidates.get(index) else {
                break;
            };
            index += 1;
            let updated = match self.get_updated_criteria(&candidate) {
                Ok(updated) => updated,
                Err(AddError::Conflicted(conflict)) => {
                    causes.push(conflict);
                    continue;
                }
                Err(AddError::Provider(err)) => return Err(err.into()),
            };
            // sanity check the provider's own matching
            let satisfied = criterion
                .iter_requirement()
                .all(|r| self.provider.is_satisfied_by(r, &candidate));
            if !satisfied {
                return Err(ResolutionError::InconsistentCandidate {
                    identifier: name.to_string(),
                });
            }
            self.reporter.pinning(&candidate);
            let state = self.state_mut();
            state.criteria = updated;
            // put the newly pinned candidate at the end of the mapping
            state.mapping.shift_remove(name);
            state.mapping.insert(name.to_string(), candidate);
            return Ok(Vec::new());
        }
        Ok(causes)
    }

    /// Walks back to the most recent pin whose dependencies contributed to
    /// the conflict, drops it, and marks the failed candidate incompatible.
    /// Returns whether a retryable state was restored.
    fn backjump(
        &mut self,
        causes: &[RequirementInformation],
    ) -> Result<bool, ResolutionError> {
        let incompatible_deps: HashSet<String> = causes
            .iter()
            .flat_map(|cause| {
                cause
                    .parent
                    .iter()
                    .map(|parent| self.provider.identify_candidate(parent))
                    .chain(std::iter::once(
                        self.provider.identify_requirement(&cause.requirement),
                    ))
            })
            .collect();

        while self.states.len() >= 3 {
            // drop the state that triggered backtracking
            self.states.pop();

            // walk further back to a state whose pin contributed to the
            // conflict
            let (name, candidate, broken_state) = loop {
                let Some(mut broken_state) = self.states.pop() else {
                    return Err(ResolutionError::Impossible {
                        causes: causes.to_vec(),
                    });
                };
                let Some((name, candidate)) = broken_state.mapping.pop() else {
                    return Err(ResolutionError::Impossible {
                        causes: causes.to_vec(),
                    });
                };
                let contributed = match self.provider.get_dependencies(&candidate) {
                    Ok(dependencies) => dependencies
                        .iter()
                        .map(|d| self.provider.identify_requirement(d))
                        .any(|id| incompatible_deps.contains(&id)),
                    Err(ProviderError::DependenciesUnavailable(_)) => false,
                    Err(err) => return Err(err.into()),
                };
                if contributed {
                    break (name, candidate, broken_state);
                }
            };

            let mut incompatibilities_from_broken: Vec<(String, Vec<Candidate>)> = broken_state
                .criteria
                .iter()
                .map(|(k, criterion)| (k.clone(), criterion.incompatibilities.clone()))
                .collect();
            incompatibilities_from_broken.push((name, vec![candidate]));

            self.push_new_state();
            if self.patch_criteria(incompatibilities_from_broken)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-evaluates the criteria of the restored state with the
    /// incompatibilities learned from the broken one. Fails when any
    /// identifier is left without candidates.
    fn patch_criteria(
        &mut self,
        incompatibilities_from_broken: Vec<(String, Vec<Candidate>)>,
    ) -> Result<bool, ResolutionError> {
        for (identifier, incompatibilities) in incompatibilities_from_broken {
            if incompatibilities.is_empty() {
                continue;
            }
            let Some(criterion) = self.state().criteria.get(&identifier).cloned() else {
                continue;
            };
            let matches = self.provider.find_matches(
                &identifier,
                &self.state().criteria,
                &[],
                &incompatibilities,
            )?;
            if matches.is_empty() {
                return Ok(false);
            }
            let mut merged = incompatibilities;
            merged.extend(criterion.incompatibilities.iter().cloned());
            let state = self.state_mut();
            state.criteria.insert(
                identifier,
                Rc::new(Criterion {
                    candidates: matches,
                    information: criterion.information.clone(),
                    incompatibilities: merged,
                }),
            );
        }
        Ok(true)
    }

    /// Drops requirement information contributed by pins that are no longer
    /// satisfying, so stale constraints do not linger.
    fn remove_information_from_criteria(&mut self, parents: &HashSet<String>) {
        if parents.is_empty() {
            return;
        }
        let provider = self.provider;
        let state = self.states.last_mut().expect("state exists");
        let keys: Vec<String> = state.criteria.keys().cloned().collect();
        for key in keys {
            let criterion = &state.criteria[&key];
            let information: Vec<RequirementInformation> = criterion
                .information
                .iter()
                .filter(|info| {
                    info.parent
                        .as_ref()
                        .map_or(true, |p| !parents.contains(&provider.identify_candidate(p)))
                })
                .cloned()
                .collect();
            if information.len() == criterion.information.len() {
                continue;
            }
            let replacement = Rc::new(Criterion {
                candidates: criterion.candidates.clone(),
                information,
                incompatibilities: criterion.incompatibilities.clone(),
            });
            state.criteria.insert(key, replacement);
        }
    }

    /// Runs the resolution until every criterion is satisfied by a pin, the
    /// round budget is exhausted, or no consistent state remains.
    pub fn resolve(
        mut self,
        requirements: Vec<Requirement>,
        max_rounds: usize,
    ) -> Result<ResolutionResult, ResolutionError> {
        let mut criteria = Criteria::new();
        for requirement in requirements {
            match self.add_to_criteria(&mut criteria, requirement, None) {
                Ok(()) => {}
                Err(AddError::Conflicted(criterion)) => {
                    return Err(ResolutionError::Impossible {
                        causes: criterion.information.clone(),
                    })
                }
                Err(AddError::Provider(err)) => return Err(err.into()),
            }
        }
        self.states.push(State {
            mapping: IndexMap::new(),
            criteria,
            backtrack_causes: Vec::new(),
        });
        self.reporter.starting();

        for round_index in 0..max_rounds {
            self.reporter.starting_round(round_index);

            let unsatisfied_names: Vec<String> = self
                .state()
                .criteria
                .iter()
                .filter(|(name, criterion)| !self.is_current_pin_satisfying(name, criterion))
                .map(|(name, _)| name.clone())
                .collect();

            if unsatisfied_names.is_empty() {
                self.reporter.ending(self.state().mapping.len());
                let state = self.states.pop().expect("state exists");
                return Ok(ResolutionResult {
                    mapping: state.mapping,
                    criteria: state.criteria,
                });
            }

            let satisfied_names: HashSet<String> = self
                .state()
                .criteria
                .keys()
                .filter(|name| !unsatisfied_names.contains(*name))
                .cloned()
                .collect();

            // the name with the lowest preference is resolved first
            let name = unsatisfied_names
                .into_iter()
                .min_by_key(|name| {
                    self.provider.get_preference(
                        name,
                        &self.state().mapping,
                        &self.state().criteria,
                        &self.state().backtrack_causes,
                    )
                })
                .expect("at least one unsatisfied name");
            tracing::debug!(round = round_index, identifier = %name, "pinning next identifier");

            let failure_criteria = self.attempt_to_pin(&name)?;
            if !failure_criteria.is_empty() {
                let causes: Vec<RequirementInformation> = failure_criteria
                    .iter()
                    .flat_map(|criterion| criterion.information.iter().cloned())
                    .collect();
                self.reporter.resolving_conflicts(&causes);
                let success = self.backjump(&causes)?;
                self.state_mut().backtrack_causes = causes;
                if !success {
                    let causes = self.state().backtrack_causes.clone();
                    return Err(ResolutionError::Impossible { causes });
                }
            } else {
                // pins invalidated by the new criteria stop contributing
                // information
                let newly_unsatisfied: HashSet<String> = self
                    .state()
                    .criteria
                    .iter()
                    .filter(|(name, criterion)| {
                        satisfied_names.contains(*name)
                            && !self.is_current_pin_satisfying(name, criterion)
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                let newly_unsatisfied_pins: HashSet<String> = newly_unsatisfied
                    .iter()
                    .filter_map(|name| {
                        self.state()
                            .mapping
                            .get(name)
                            .map(|candidate| self.provider.identify_candidate(candidate))
                    })
                    .collect();
                self.remove_information_from_criteria(&newly_unsatisfied_pins);
                self.push_new_state();
            }
            self.reporter.ending_round(round_index);
        }
        Err(ResolutionError::TooDeep(max_rounds))
    }
}

fn dependency_failure(err: ProviderError) -> AddError {
    match err {
        // unusable metadata surfaces as an empty conflict so the engine
        // simply tries the next candidate
        ProviderError::DependenciesUnavailable(_) => AddError::Conflicted(Rc::new(Criterion {
            candidates: LazySequence::from_vec(Vec::new()),
            information: Vec::new(),
            incompatibilities: Vec::new(),
        })),
        other => AddError::Provider(other),
    }
}

impl Display for RequirementInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{} (from {})", self.requirement.as_line(), parent),
            None => write!(f, "{} (from project)", self.requirement.as_line()),
        }
    }
}
