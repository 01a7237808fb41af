use crate::config::QuoteQueryConfig;
use crate::domain::ids::{ProjectId, UserId};
use crate::domain::ports::{ProfileStoreRef, QuoteQuery, QuoteStoreRef};
use crate::domain::quote::{ProfileProjection, Quote, QuoteStatus, QuoteWithProfile, Viewer, ViewerRole};
use crate::error::{Result, SyncError};
use miette::Diagnostic;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

/// Caller-supplied narrowing of a quote listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteFilters {
    pub project_id: Option<ProjectId>,
    pub status: Option<QuoteStatus>,
    /// Opt in to seeing rows that fail the ownership predicate.
    pub include_all: bool,
}

impl QuoteFilters {
    /// Filters scoped to one project.
    pub fn for_project(project_id: impl Into<ProjectId>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Default::default()
        }
    }

    /// Opts in to rows found by the fallback query.
    pub fn include_all(mut self) -> Self {
        self.include_all = true;
        self
    }
}

/// Rows exist for the project but are owned by an identity other than the viewer.
///
/// Returned alongside a successful fetch, never as an error: the rows may have been
/// written with the wrong owner id upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("{hidden_rows} quote(s) for project {project_id} fail the ownership check for {viewer_id}")]
#[diagnostic(
    code(ledgersync::ownership_mismatch),
    help("set include_all to view the broadened result")
)]
pub struct OwnershipMismatch {
    pub project_id: ProjectId,
    pub viewer_id: UserId,
    pub role: ViewerRole,
    pub hidden_rows: usize,
    /// Distinct owner identities found on the project's rows.
    pub found_owners: Vec<UserId>,
}

/// Which query produced the rows of a [`QuoteFetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteScope {
    Strict,
    /// The project-only fallback replaced an empty strict result.
    Widened,
}

/// Listing returned by [`QuoteQueryEngine::fetch_quotes`].
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteFetch {
    pub quotes: Vec<QuoteWithProfile>,
    pub scope: QuoteScope,
    pub diagnostic: Option<OwnershipMismatch>,
}

impl QuoteFetch {
    /// A strict listing with no rows and no diagnostic.
    pub fn empty() -> Self {
        Self {
            quotes: Vec::new(),
            scope: QuoteScope::Strict,
            diagnostic: None,
        }
    }
}

/// Role-scoped quote listings with counterpart profiles attached.
pub struct QuoteQueryEngine {
    quotes: QuoteStoreRef,
    profiles: ProfileStoreRef,
    config: QuoteQueryConfig,
}

impl QuoteQueryEngine {
    /// Creates a new `QuoteQueryEngine`.
    ///
    /// # Arguments
    ///
    /// * `quotes` - The quotes table.
    /// * `profiles` - Profile projections attached to each row.
    /// * `config` - Whether the project-only fallback query may run.
    pub fn new(quotes: QuoteStoreRef, profiles: ProfileStoreRef, config: QuoteQueryConfig) -> Self {
        Self {
            quotes,
            profiles,
            config,
        }
    }

    /// The ownership-scoped query for `viewer`.
    ///
    /// Counterparts always see only the quotes they submitted. Owners see quotes on their
    /// projects, or every quote in scope when `include_all` is set.
    pub fn strict_query(viewer: &Viewer, filters: &QuoteFilters) -> QuoteQuery {
        let mut query = QuoteQuery {
            project_id: filters.project_id.clone(),
            status: filters.status,
            ..Default::default()
        };
        match viewer.role {
            ViewerRole::Counterpart => query.freelancer_id = Some(viewer.id.clone()),
            ViewerRole::Owner if !filters.include_all => query.client_id = Some(viewer.id.clone()),
            ViewerRole::Owner => {}
        }
        query
    }

    /// Fetches the viewer's quotes, widening to the whole project when the strict query
    /// is empty and widening is enabled.
    ///
    /// An empty result is a success. Store failures surface as `QueryFailed`.
    pub async fn fetch_quotes(&self, viewer: &Viewer, filters: &QuoteFilters) -> Result<QuoteFetch> {
        let strict = Self::strict_query(viewer, filters);
        let rows = self.select(&strict).await?;
        if !rows.is_empty() {
            return Ok(QuoteFetch {
                quotes: self.attach_profiles(viewer.role, rows).await,
                scope: QuoteScope::Strict,
                diagnostic: None,
            });
        }

        let Some(project_id) = filters.project_id.clone() else {
            return Ok(QuoteFetch::empty());
        };
        if !self.config.fallback_widening || !strict.has_ownership_predicate() {
            return Ok(QuoteFetch::empty());
        }

        let widened = QuoteQuery {
            project_id: Some(project_id.clone()),
            status: filters.status,
            ..Default::default()
        };
        let rows = self.select(&widened).await?;
        if rows.is_empty() {
            return Ok(QuoteFetch::empty());
        }

        let found_owners: Vec<UserId> = rows
            .iter()
            .map(|quote| match viewer.role {
                ViewerRole::Owner => quote.client_id.clone(),
                ViewerRole::Counterpart => quote.freelancer_id.clone(),
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mismatch = OwnershipMismatch {
            project_id,
            viewer_id: viewer.id.clone(),
            role: viewer.role,
            hidden_rows: rows.len(),
            found_owners,
        };
        warn!(
            project_id = %mismatch.project_id,
            viewer_id = %mismatch.viewer_id,
            hidden_rows = mismatch.hidden_rows,
            include_all = filters.include_all,
            "strict quote query empty but project has rows owned by another identity"
        );

        if filters.include_all {
            Ok(QuoteFetch {
                quotes: self.attach_profiles(viewer.role, rows).await,
                scope: QuoteScope::Widened,
                diagnostic: Some(mismatch),
            })
        } else {
            Ok(QuoteFetch {
                quotes: Vec::new(),
                scope: QuoteScope::Strict,
                diagnostic: Some(mismatch),
            })
        }
    }

    async fn select(&self, query: &QuoteQuery) -> Result<Vec<Quote>> {
        let rows = self
            .quotes
            .select(query)
            .await
            .map_err(SyncError::into_query_failed)?;
        debug!(?query, rows = rows.len(), "quote query");
        Ok(rows)
    }

    /// Attaches the counterpart's profile to each quote; missing profiles are empty.
    async fn attach_profiles(&self, role: ViewerRole, quotes: Vec<Quote>) -> Vec<QuoteWithProfile> {
        let ids: Vec<UserId> = quotes
            .iter()
            .map(|quote| quote.counterpart_of(role).clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let by_id: HashMap<UserId, ProfileProjection> = match self.profiles.profiles(&ids).await {
            Ok(profiles) => profiles
                .into_iter()
                .map(|profile| (profile.user_id.clone(), profile))
                .collect(),
            Err(err) => {
                warn!(error = %err, "profile lookup failed, attaching empty profiles");
                HashMap::new()
            }
        };

        quotes
            .into_iter()
            .map(|quote| {
                let counterpart = quote.counterpart_of(role);
                let profile = by_id
                    .get(counterpart)
                    .cloned()
                    .unwrap_or_else(|| ProfileProjection::empty(counterpart.clone()));
                QuoteWithProfile { quote, profile }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::{InMemoryProfileStore, InMemoryQuoteStore};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn quote(id: &str, project: &str, client: &str, freelancer: &str, age_hours: i64) -> Quote {
        let now = Utc::now();
        Quote {
            id: id.into(),
            project_id: project.into(),
            client_id: client.into(),
            freelancer_id: freelancer.into(),
            status: QuoteStatus::Pending,
            created_at: now - Duration::hours(age_hours),
            updated_at: now,
        }
    }

    async fn engine_with(
        quotes: Vec<Quote>,
        config: QuoteQueryConfig,
    ) -> (QuoteQueryEngine, InMemoryQuoteStore, InMemoryProfileStore) {
        let quote_store = InMemoryQuoteStore::new();
        for q in quotes {
            quote_store.upsert(q).await;
        }
        let profile_store = InMemoryProfileStore::new();
        profile_store
            .put(ProfileProjection {
                user_id: "f1".into(),
                display_name: "Fay".into(),
                avatar_url: None,
                headline: "Rust contractor".into(),
            })
            .await;
        profile_store
            .put(ProfileProjection {
                user_id: "c1".into(),
                display_name: "Cal".into(),
                avatar_url: Some("https://cdn.example/c1.png".into()),
                headline: String::new(),
            })
            .await;
        let engine = QuoteQueryEngine::new(
            Arc::new(quote_store.clone()),
            Arc::new(profile_store.clone()),
            config,
        );
        (engine, quote_store, profile_store)
    }

    fn ids(fetch: &QuoteFetch) -> Vec<&str> {
        fetch.quotes.iter().map(|q| q.quote.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_counterpart_sees_only_own_quotes() {
        let (engine, _, _) = engine_with(
            vec![
                quote("q1", "p1", "c1", "f1", 2),
                quote("q2", "p1", "c1", "f2", 1),
                quote("q3", "p2", "c2", "f1", 0),
            ],
            QuoteQueryConfig::default(),
        )
        .await;

        let fetch = engine
            .fetch_quotes(&Viewer::counterpart("f1"), &QuoteFilters::default())
            .await
            .unwrap();
        assert_eq!(ids(&fetch), vec!["q3", "q1"]);
        assert_eq!(fetch.scope, QuoteScope::Strict);
        assert!(fetch.diagnostic.is_none());
    }

    #[tokio::test]
    async fn test_owner_scoping_and_include_all() {
        let (engine, _, _) = engine_with(
            vec![quote("q1", "p1", "c1", "f1", 1), quote("q2", "p1", "c9", "f2", 0)],
            QuoteQueryConfig::default(),
        )
        .await;
        let owner = Viewer::owner("c1");

        let strict = engine
            .fetch_quotes(&owner, &QuoteFilters::for_project("p1"))
            .await
            .unwrap();
        assert_eq!(ids(&strict), vec!["q1"]);

        let all = engine
            .fetch_quotes(&owner, &QuoteFilters::for_project("p1").include_all())
            .await
            .unwrap();
        assert_eq!(ids(&all), vec!["q2", "q1"]);
    }

    #[tokio::test]
    async fn test_mismatched_owner_surfaces_diagnostic_without_rows() {
        let (engine, store, _) = engine_with(
            vec![quote("q1", "p1", "someone-else", "f1", 1), quote("q2", "p1", "other", "f2", 0)],
            QuoteQueryConfig::default(),
        )
        .await;

        let fetch = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::for_project("p1"))
            .await
            .unwrap();

        assert!(fetch.quotes.is_empty());
        let diagnostic = fetch.diagnostic.expect("mismatch should be reported");
        assert_eq!(diagnostic.hidden_rows, 2);
        assert_eq!(
            diagnostic.found_owners,
            vec![UserId::from("other"), UserId::from("someone-else")]
        );
        assert_eq!(store.select_count(), 2);
    }

    #[tokio::test]
    async fn test_include_all_substitutes_widened_rows() {
        let (engine, _, _) = engine_with(
            vec![quote("q1", "p1", "c1", "f-typo", 0)],
            QuoteQueryConfig::default(),
        )
        .await;

        let fetch = engine
            .fetch_quotes(&Viewer::counterpart("f1"), &QuoteFilters::for_project("p1").include_all())
            .await
            .unwrap();

        assert_eq!(ids(&fetch), vec!["q1"]);
        assert_eq!(fetch.scope, QuoteScope::Widened);
        assert!(fetch.diagnostic.is_some());
        assert_eq!(fetch.quotes[0].profile.display_name, "Cal");
    }

    #[tokio::test]
    async fn test_no_widening_without_project_or_when_disabled() {
        let (engine, store, _) = engine_with(
            vec![quote("q1", "p1", "c2", "f1", 0)],
            QuoteQueryConfig::default(),
        )
        .await;
        let fetch = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::default().include_all())
            .await
            .unwrap();
        // include_all with no ownership predicate sees everything directly
        assert_eq!(ids(&fetch), vec!["q1"]);

        let fetch = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::default())
            .await
            .unwrap();
        assert_eq!(fetch, QuoteFetch::empty());
        assert_eq!(store.select_count(), 2);

        let (engine, store, _) = engine_with(
            vec![quote("q1", "p1", "c2", "f1", 0)],
            QuoteQueryConfig {
                fallback_widening: false,
            },
        )
        .await;
        let fetch = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::for_project("p1").include_all())
            .await
            .unwrap();
        assert_eq!(ids(&fetch), vec!["q1"]);
        let fetch = engine
            .fetch_quotes(&Viewer::counterpart("f9"), &QuoteFilters::for_project("p1").include_all())
            .await
            .unwrap();
        assert_eq!(fetch, QuoteFetch::empty());
        assert_eq!(store.select_count(), 2);
    }

    #[tokio::test]
    async fn test_profiles_fetched_in_one_batch_with_defaults() {
        let (engine, _, profiles) = engine_with(
            vec![
                quote("q1", "p1", "c1", "f1", 2),
                quote("q2", "p2", "c1", "f1", 1),
                quote("q3", "p3", "c1", "f-unknown", 0),
            ],
            QuoteQueryConfig::default(),
        )
        .await;

        let fetch = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::default())
            .await
            .unwrap();

        assert_eq!(
            profiles.requested_batches(),
            vec![vec![UserId::from("f-unknown"), UserId::from("f1")]]
        );
        assert_eq!(fetch.quotes[0].profile, ProfileProjection::empty("f-unknown".into()));
        assert_eq!(fetch.quotes[1].profile.display_name, "Fay");
        assert_eq!(fetch.quotes[2].profile.display_name, "Fay");
    }

    #[tokio::test]
    async fn test_profile_failure_defaults_instead_of_erroring() {
        let (engine, _, profiles) = engine_with(
            vec![quote("q1", "p1", "c1", "f1", 0)],
            QuoteQueryConfig::default(),
        )
        .await;
        profiles.fail_next_reads(1);

        let fetch = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::default())
            .await
            .unwrap();
        assert_eq!(fetch.quotes[0].profile, ProfileProjection::empty("f1".into()));
    }

    #[tokio::test]
    async fn test_store_failure_is_query_failed() {
        let (engine, store, _) = engine_with(vec![], QuoteQueryConfig::default()).await;
        store.fail_next_reads(1);

        let err = engine
            .fetch_quotes(&Viewer::owner("c1"), &QuoteFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::QueryFailed(_)));
    }

    #[test]
    fn test_status_filter_carried_into_query() {
        let filters = QuoteFilters {
            status: Some(QuoteStatus::Accepted),
            ..QuoteFilters::for_project("p1")
        };
        let query = QuoteQueryEngine::strict_query(&Viewer::counterpart("f1"), &filters);
        assert_eq!(query.status, Some(QuoteStatus::Accepted));
        assert_eq!(query.freelancer_id, Some(UserId::from("f1")));
        assert_eq!(query.client_id, None);
    }
}
