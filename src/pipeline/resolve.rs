//! Search expression → deduplicated PMID list, paging by date-window halving when the
//! result set exceeds what one esearch page can return.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use time::Date;
use tracing::{info, warn};

use crate::error::CitegraphError;
use crate::sources::eutils::{DateRange, EutilsClient, SearchPage};
use crate::utils::date;

pub const ID_LIST_HEADER: &str = "pmid";

#[async_trait]
pub trait IdSearch: Send + Sync {
    async fn search(
        &self,
        term: &str,
        retmax: usize,
        range: Option<&DateRange>,
    ) -> Result<SearchPage, CitegraphError>;
}

#[async_trait]
impl IdSearch for EutilsClient {
    async fn search(
        &self,
        term: &str,
        retmax: usize,
        range: Option<&DateRange>,
    ) -> Result<SearchPage, CitegraphError> {
        self.esearch(term, retmax, range).await
    }
}

#[derive(Debug, Clone)]
pub struct ResolveParams {
    pub term: String,
    pub retmax: usize,
    pub page_ceiling: usize,
    pub min_date: Date,
    pub max_date: Date,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveOutcome {
    pub ids: Vec<String>,
    /// Count reported by the upstream for the whole query.
    pub total: usize,
    /// False when the loop stopped before collecting `total` identifiers.
    pub complete: bool,
}

#[derive(Default)]
struct OrderedIds {
    seen: HashSet<String>,
    ids: Vec<String>,
}

impl OrderedIds {
    fn extend(&mut self, ids: Vec<String>) {
        for id in ids {
            let id = id.trim().to_string();
            if id.is_empty() {
                continue;
            }
            if self.seen.insert(id.clone()) {
                self.ids.push(id);
            }
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

fn window(min: Date, max: Date) -> DateRange {
    DateRange {
        min: date::format_slash(min),
        max: date::format_slash(max),
    }
}

pub async fn resolve(
    search: &dyn IdSearch,
    params: &ResolveParams,
) -> Result<ResolveOutcome, CitegraphError> {
    let ceiling = params.page_ceiling.max(1);
    if params.min_date > params.max_date {
        return Err(CitegraphError::InvalidArgument(format!(
            "Search window starts after it ends: {} > {}",
            date::format_slash(params.min_date),
            date::format_slash(params.max_date)
        )));
    }

    if params.retmax <= ceiling {
        let page = search.search(&params.term, params.retmax, None).await?;
        let mut acc = OrderedIds::default();
        acc.extend(page.ids);
        info!(count = page.count, found = acc.len(), "single-page search");
        return Ok(ResolveOutcome {
            complete: acc.len() >= page.count.min(params.retmax),
            total: page.count,
            ids: acc.ids,
        });
    }

    let final_date = params.max_date;
    let full = search
        .search(&params.term, 0, Some(&window(params.min_date, final_date)))
        .await?;
    let total = full.count;
    info!(total, "total results over the full window");
    if total == 0 {
        return Ok(ResolveOutcome {
            ids: Vec::new(),
            total,
            complete: true,
        });
    }

    let mut acc = OrderedIds::default();
    let mut lo = params.min_date;
    let mut hi = final_date;
    let mut iterations = 0usize;

    while acc.len() < total {
        if iterations >= params.max_iterations {
            warn!(
                iterations,
                found = acc.len(),
                total,
                "halving iteration cap reached, keeping partial results"
            );
            break;
        }
        iterations += 1;

        let range = window(lo, hi);
        let page = match search.search(&params.term, ceiling, Some(&range)).await {
            Ok(page) => page,
            Err(CitegraphError::Cancelled) => return Err(CitegraphError::Cancelled),
            Err(err) => {
                warn!(
                    min = %range.min,
                    max = %range.max,
                    found = acc.len(),
                    "search window failed, keeping partial results: {err}"
                );
                break;
            }
        };

        if page.count >= ceiling && lo < hi {
            hi = date::midpoint(lo, hi);
            continue;
        }
        if page.count >= ceiling {
            warn!(
                day = %range.min,
                count = page.count,
                ceiling,
                "single-day window exceeds the page ceiling, results truncated"
            );
        }

        acc.extend(page.ids);
        info!(
            min = %range.min,
            max = %range.max,
            count = page.count,
            found = acc.len(),
            "accepted search window"
        );
        if hi >= final_date {
            break;
        }
        lo = date::next_day(hi);
        hi = final_date;
    }

    let complete = acc.len() >= total;
    if !complete {
        warn!(found = acc.len(), total, "identifier list is incomplete");
    }
    Ok(ResolveOutcome {
        ids: acc.ids,
        total,
        complete,
    })
}

pub fn write_id_list(path: &Path, ids: &[String]) -> Result<(), CitegraphError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([ID_LIST_HEADER])?;
    for id in ids {
        writer.write_record([id])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read an identifier list, keeping the first column and dropping repeats.
pub fn read_id_list(path: &Path) -> Result<Vec<String>, CitegraphError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record?;
        match record.get(0) {
            Some(id) if !id.is_empty() && !id.eq_ignore_ascii_case(ID_LIST_HEADER) => {
                ids.push(id.to_string());
            }
            _ => {}
        }
    }
    let mut acc = OrderedIds::default();
    acc.extend(ids);
    Ok(acc.ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::Month;

    fn d(y: i32, m: u8, day: u8) -> Date {
        Date::from_calendar_date(y, Month::try_from(m).unwrap(), day).unwrap()
    }

    /// In-memory esearch over `(publication date, pmid)` pairs.
    struct FakeSearch {
        articles: Vec<(Date, String)>,
        calls: AtomicUsize,
        fail_after: Option<usize>,
        windows: Mutex<Vec<DateRange>>,
    }

    impl FakeSearch {
        fn new(articles: Vec<(Date, String)>) -> Self {
            Self {
                articles,
                calls: AtomicUsize::new(0),
                fail_after: None,
                windows: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IdSearch for FakeSearch {
        async fn search(
            &self,
            _term: &str,
            retmax: usize,
            range: Option<&DateRange>,
        ) -> Result<SearchPage, CitegraphError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| call >= n) {
                return Err(CitegraphError::MalformedResponse {
                    api: "eutils".into(),
                    message: "esearch response has no esearchresult".into(),
                });
            }
            let matching: Vec<&String> = match range {
                Some(range) => {
                    self.windows.lock().unwrap().push(range.clone());
                    let min = date::parse_slash(&range.min).unwrap();
                    let max = date::parse_slash(&range.max).unwrap();
                    self.articles
                        .iter()
                        .filter(|(day, _)| *day >= min && *day <= max)
                        .map(|(_, id)| id)
                        .collect()
                }
                None => self.articles.iter().map(|(_, id)| id).collect(),
            };
            Ok(SearchPage {
                count: matching.len(),
                ids: matching.into_iter().take(retmax).cloned().collect(),
            })
        }
    }

    fn corpus(n: usize, clustered: bool) -> Vec<(Date, String)> {
        let start = d(2000, 1, 1);
        (0..n)
            .map(|i| {
                let offset = if clustered { (i % 7) as i64 } else { (i * 3) as i64 };
                (start + time::Duration::days(offset), format!("{}", 100_000 + i))
            })
            .collect()
    }

    fn params(retmax: usize, ceiling: usize) -> ResolveParams {
        ResolveParams {
            term: "kidney".into(),
            retmax,
            page_ceiling: ceiling,
            min_date: d(1900, 1, 1),
            max_date: d(2025, 12, 31),
            max_iterations: 10_000,
        }
    }

    #[tokio::test]
    async fn single_page_when_retmax_fits() {
        let fake = FakeSearch::new(corpus(5, false));
        let out = resolve(&fake, &params(100, 9999)).await.unwrap();
        assert_eq!(out.ids.len(), 5);
        assert!(out.complete);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn halving_collects_every_identifier_exactly_once() {
        let fake = FakeSearch::new(corpus(250, false));
        let out = resolve(&fake, &params(20_000, 40)).await.unwrap();
        assert_eq!(out.total, 250);
        assert_eq!(out.ids.len(), 250);
        let unique: HashSet<&String> = out.ids.iter().collect();
        assert_eq!(unique.len(), 250);
        assert!(out.complete);
        for window in fake.windows.lock().unwrap().iter() {
            assert!(date::parse_slash(&window.min) <= date::parse_slash(&window.max));
        }
    }

    #[tokio::test]
    async fn halving_handles_dense_clusters() {
        // 7 distinct days, 20 articles per day at most with a ceiling of 25.
        let fake = FakeSearch::new(corpus(140, true));
        let out = resolve(&fake, &params(20_000, 25)).await.unwrap();
        assert_eq!(out.ids.len(), 140);
        assert!(out.complete);
    }

    #[tokio::test]
    async fn overfull_single_day_is_accepted_truncated() {
        let fake = FakeSearch::new(corpus(30, true).into_iter().map(|(_, id)| (d(2001, 5, 5), id)).collect());
        let out = resolve(&fake, &params(20_000, 10)).await.unwrap();
        assert_eq!(out.ids.len(), 10);
        assert!(!out.complete);
    }

    #[tokio::test]
    async fn structural_error_keeps_partial_results() {
        let mut fake = FakeSearch::new(corpus(100, false));
        // The total query plus five windows succeed; at most 5 * 19 identifiers.
        fake.fail_after = Some(6);
        let out = resolve(&fake, &params(20_000, 20)).await.unwrap();
        assert!(!out.complete);
        assert!(out.ids.len() < 100);
        let unique: HashSet<&String> = out.ids.iter().collect();
        assert_eq!(unique.len(), out.ids.len());
    }

    #[tokio::test]
    async fn iteration_cap_stops_the_loop() {
        let fake = FakeSearch::new(corpus(100, false));
        let mut p = params(20_000, 20);
        p.max_iterations = 3;
        let out = resolve(&fake, &p).await.unwrap();
        assert!(!out.complete);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_total_short_circuits() {
        let fake = FakeSearch::new(Vec::new());
        let out = resolve(&fake, &params(20_000, 20)).await.unwrap();
        assert!(out.ids.is_empty());
        assert!(out.complete);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn id_list_round_trips_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ids.csv");
        write_id_list(&path, &["1".into(), "2".into()]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("pmid\n"));
        assert_eq!(read_id_list(&path).unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn id_list_reads_first_column_and_drops_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "pmid,note\n 7 ,\"first, quoted\"\n\n8\n7,again\n").unwrap();
        assert_eq!(read_id_list(&path).unwrap(), vec!["7", "8"]);
    }
}
