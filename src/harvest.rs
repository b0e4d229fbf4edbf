//! Run controller: one method per harvest command
//!
//! The controller owns the run-wide shared state (fetch session, warehouse,
//! overflow ledger) and builds a fresh paginator, transformer and
//! checkpointer for every command. `finish` must run however a command
//! ended: it persists the ledger and closes every fetch session.

use crate::config::{ConfigError, HarvestConfig};
use crate::error::HarvestResult;
use crate::pipeline::fetch::Fetcher;
use crate::pipeline::ledger::{load_ledger, merge_ledgers, OverflowLedger};
use crate::pipeline::paginator::{Endpoint, Paginator};
use crate::pipeline::query::{expand_search_keys, GeoType, QueryKey, SearchFilter};
use crate::pipeline::save::Checkpointer;
use crate::pipeline::scheduler::{run_all, RunSummary, SchedulerConfig};
use crate::pipeline::transform::{RecordTransformer, Transform};
use crate::sources::brreg::{self, Entity, Selection};
use crate::sources::enin;
use crate::warehouse::Warehouse;
use std::sync::Arc;

/// NACE list meaning "every code in the code table"
pub const ALL_NACE: &str = ".";

pub struct Harvester {
    config: HarvestConfig,
    fetcher: Arc<dyn Fetcher>,
    accounts_fetcher: Option<Arc<dyn Fetcher>>,
    warehouse: Arc<dyn Warehouse>,
    ledger: Arc<OverflowLedger>,
}

impl Harvester {
    pub fn new(config: HarvestConfig, fetcher: Arc<dyn Fetcher>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config,
            fetcher,
            accounts_fetcher: None,
            warehouse,
            ledger: Arc::new(OverflowLedger::new()),
        }
    }

    /// Authenticated fetcher for the commercial accounts API
    pub fn with_accounts_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.accounts_fetcher = Some(fetcher);
        self
    }

    pub fn ledger(&self) -> &Arc<OverflowLedger> {
        &self.ledger
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(
            self.config.concurrency,
            self.config.batch_size,
            self.config.save_interval,
        )
    }

    fn paginator(&self, fetcher: Arc<dyn Fetcher>, endpoint: Arc<dyn Endpoint>) -> Arc<Paginator> {
        Arc::new(Paginator::new(
            fetcher,
            endpoint,
            Arc::clone(&self.ledger),
            self.config.page_size,
            self.config.page_ceiling,
        ))
    }

    fn checkpointer(&self) -> Checkpointer {
        Checkpointer::new(
            Arc::clone(&self.warehouse),
            Arc::clone(&self.ledger),
            self.config.ledger_path.clone(),
        )
    }

    async fn run(
        &self,
        keys: Vec<QueryKey>,
        paginator: Arc<Paginator>,
        transform: &dyn Transform,
        saver: &Checkpointer,
    ) -> HarvestResult<RunSummary> {
        run_all(keys, paginator, transform, saver, self.scheduler_config()).await
    }

    /// Company search by NACE codes and/or geography values
    ///
    /// A NACE list of `["."]` expands to every code in the code table that
    /// is not already known to overflow.
    pub async fn search_companies(
        &self,
        nace_codes: &[String],
        geo_values: &[String],
        geo_type: GeoType,
    ) -> HarvestResult<RunSummary> {
        let nace_codes = if nace_codes == [ALL_NACE] {
            let known = merge_ledgers(load_ledger(&self.config.ledger_path), self.ledger.snapshot());
            brreg::all_nace_codes(self.warehouse.as_ref(), &known).await?
        } else {
            nace_codes.to_vec()
        };

        let (filter, keys) = expand_search_keys(&nace_codes, geo_values, geo_type)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        self.search(filter, keys).await
    }

    /// Rerun every key recorded under `kind` as NACE × geography pairs
    pub async fn resplit(&self, kind: &str, geo_values: &[String], geo_type: GeoType) -> HarvestResult<RunSummary> {
        let known = merge_ledgers(load_ledger(&self.config.ledger_path), self.ledger.snapshot());
        let keys = brreg::resplit_keys(&known, kind, geo_values);
        log::info!(
            "🔀 Re-splitting {} overflowing {} keys into {} {} pairs",
            known.get(kind).map_or(0, |k| k.len()),
            kind,
            keys.len(),
            SearchFilter::NaceGeo(geo_type).kind()
        );
        self.search(SearchFilter::NaceGeo(geo_type), keys).await
    }

    async fn search(&self, filter: SearchFilter, keys: Vec<QueryKey>) -> HarvestResult<RunSummary> {
        let endpoint = Arc::new(brreg::CompanySearch::new(
            &self.config.brreg_base_url,
            filter,
            self.config.page_size,
        ));
        let paginator = self.paginator(Arc::clone(&self.fetcher), endpoint);
        let transform = RecordTransformer::new(brreg::COMPANY_TABLE, brreg::company_search_spec());
        let saver = self
            .checkpointer()
            .target(brreg::COMPANY_TABLE, brreg::company_target());
        self.run(keys, paginator, &transform, &saver).await
    }

    /// Fetch one registry entity for a selection of organisation numbers
    pub async fn fetch_entity(&self, entity: Entity, selection: &Selection) -> HarvestResult<RunSummary> {
        let org_numbers = brreg::select_org_numbers(self.warehouse.as_ref(), selection).await?;
        let keys = org_numbers.iter().map(QueryKey::single).collect();

        let paginator = self.paginator(
            Arc::clone(&self.fetcher),
            entity.endpoint(&self.config.brreg_base_url),
        );
        let transform = RecordTransformer::new(entity.table(), entity.transform_spec());
        let saver = self.checkpointer().target(entity.table(), entity.save_target());
        self.run(keys, paginator, &transform, &saver).await
    }

    /// Financials, company details and roles for the same organisation numbers
    pub async fn fill_companies(&self, org_numbers: &[String]) -> HarvestResult<Vec<RunSummary>> {
        let selection = Selection::Explicit(org_numbers.to_vec());
        let mut summaries = Vec::new();
        for entity in [Entity::Financials, Entity::Companies, Entity::Roles] {
            summaries.push(self.fetch_entity(entity, &selection).await?);
        }
        Ok(summaries)
    }

    /// Annual accounts from the commercial API
    pub async fn accounts(&self, selection: &Selection) -> HarvestResult<RunSummary> {
        let fetcher = match &self.accounts_fetcher {
            Some(fetcher) => Arc::clone(fetcher),
            None => return Err(ConfigError::MissingVariable("ENIN_CREDENTIALS_PATH".to_string()).into()),
        };
        let org_numbers = brreg::select_org_numbers(self.warehouse.as_ref(), selection).await?;
        let keys = org_numbers.iter().map(QueryKey::single).collect();

        let endpoint = Arc::new(enin::AccountsComposite::new(&self.config.enin_base_url));
        let paginator = self.paginator(fetcher, endpoint);
        let transform = enin::AccountsTransformer::new();
        let saver = enin::save_targets()
            .into_iter()
            .fold(self.checkpointer(), |saver, (table, target)| saver.target(table, target));
        self.run(keys, paginator, &transform, &saver).await
    }

    /// Persist the ledger and release every network session
    pub async fn finish(&self) -> HarvestResult<()> {
        let persisted = self.ledger.persist(&self.config.ledger_path);
        self.fetcher.close().await;
        if let Some(fetcher) = &self.accounts_fetcher {
            fetcher.close().await;
        }
        let merged = persisted?;
        log::info!(
            "📒 Overflow ledger at {} holds {} keys",
            self.config.ledger_path.display(),
            merged.values().map(|keys| keys.len()).sum::<usize>()
        );
        Ok(())
    }
}
