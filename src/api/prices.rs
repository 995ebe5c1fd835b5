use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::core::{
    AssetStatistics, PricePoint, PriceSeries, PriceSeriesProvider, ProjectionError, Result,
    SamplingFrequency,
};

/// Exchange tickers for the ISINs users most often type in.
const ISIN_TICKERS: &[(&str, &str)] = &[
    ("IE00BK5BQT80", "VWCE.DE"),
    ("IE00B4L5Y983", "IWDA.AS"),
    ("IE00B3RBWM25", "VUSA.L"),
    ("IE00BKX55T58", "VWRL.L"),
    ("LU0392494562", "EXSA.DE"),
    ("IE00B5BMR087", "CSPX.L"),
    ("IE00BJ0KDQ92", "XDWL.DE"),
    ("IE00B3XXRP09", "VUSA.AS"),
];

const DATE_COLUMNS: &[&str] = &["date", "day", "timestamp"];
const PRICE_COLUMNS: &[&str] = &["close", "adj close", "adj_close", "price", "nav", "value"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d"];

/// Figures for funds with no public price history, used only when no price
/// file is available for them.
const KNOWN_ASSETS: &[(&str, f64, f64)] = &[("TNESCFD", 0.125, 0.15), ("TRIGON", 0.125, 0.15)];

pub fn known_asset_statistics(identifier: &str) -> Option<AssetStatistics> {
    let id = identifier.trim().to_ascii_uppercase();
    KNOWN_ASSETS
        .iter()
        .find(|(known, _, _)| id == *known || id.contains(known))
        .map(|(_, mean, vol)| AssetStatistics::from_annual(identifier, *mean, *vol))
}

pub fn ticker_for_isin(isin: &str) -> Option<&'static str> {
    ISIN_TICKERS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(isin.trim()))
        .map(|(_, ticker)| *ticker)
}

/// Directory of `<identifier>.csv` price files, one series per file.
/// `frequency` is the declared sampling; a file whose date spacing says
/// otherwise is read at the inferred frequency.
#[derive(Clone, Debug)]
pub struct CsvPriceDirectory {
    dir: PathBuf,
    frequency: SamplingFrequency,
}

impl CsvPriceDirectory {
    pub fn new(dir: impl Into<PathBuf>, frequency: SamplingFrequency) -> Self {
        Self {
            dir: dir.into(),
            frequency,
        }
    }

    /// Candidate files in lookup order: the identifier itself, then its ticker.
    fn candidates(&self, identifier: &str) -> Vec<PathBuf> {
        let id = identifier.trim();
        let mut paths = vec![self.dir.join(format!("{id}.csv"))];
        if let Some(ticker) = ticker_for_isin(id) {
            paths.push(self.dir.join(format!("{ticker}.csv")));
        }
        paths
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.resolve(identifier).is_ok()
    }

    fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        self.candidates(identifier)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| {
                ProjectionError::asset_unavailable(
                    identifier,
                    format!("no price file in {}", self.dir.display()),
                )
            })
    }
}

impl PriceSeriesProvider for CsvPriceDirectory {
    fn fetch_price_series(&self, identifier: &str, lookback_years: u32) -> Result<PriceSeries> {
        let path = self.resolve(identifier)?;
        let points = read_price_csv(&path)
            .map_err(|reason| ProjectionError::asset_unavailable(identifier, reason))?;
        debug!(
            target: "holdco::prices",
            asset = identifier,
            file = %path.display(),
            rows = points.len(),
            "loaded price file"
        );

        let frequency = match SamplingFrequency::infer(&points) {
            Some(inferred) if inferred != self.frequency => {
                warn!(
                    target: "holdco::prices",
                    asset = identifier,
                    declared = ?self.frequency,
                    inferred = ?inferred,
                    "price file spacing disagrees with declared frequency, using inferred"
                );
                inferred
            }
            Some(inferred) => inferred,
            None => {
                warn!(
                    target: "holdco::prices",
                    asset = identifier,
                    declared = ?self.frequency,
                    "cannot infer frequency from price dates, using declared"
                );
                self.frequency
            }
        };

        let series = PriceSeries {
            identifier: identifier.to_string(),
            frequency,
            points,
        };
        Ok(series.trailing_years(lookback_years))
    }
}

fn find_column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    names.iter().find_map(|name| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    // Timestamps keep only their date part.
    let raw = raw.trim().split(['T', ' ']).next()?;
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Reads a price file, skipping rows whose date or price does not parse.
/// A file whose first row is already data is read as `date,price`.
/// Rows come back sorted by date with duplicate dates dropped.
pub fn read_price_csv(path: &Path) -> std::result::Result<Vec<PricePoint>, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    let mut records = reader.records();

    let first = match records.next() {
        Some(Ok(record)) => record,
        Some(Err(e)) => return Err(format!("cannot read {}: {e}", path.display())),
        None => return Err(format!("{} is empty", path.display())),
    };

    let mut points = Vec::new();
    let mut skipped = 0usize;
    let (date_col, price_col) = match (
        find_column(&first, DATE_COLUMNS),
        find_column(&first, PRICE_COLUMNS),
    ) {
        (Some(date_col), Some(price_col)) => (date_col, price_col),
        _ if first.get(0).and_then(parse_date).is_some() && first.len() >= 2 => {
            push_row(&first, 0, 1, &mut points, &mut skipped);
            (0, 1)
        }
        _ => {
            return Err(format!(
                "{} needs a date column and a close/price/nav/value column",
                path.display()
            ));
        }
    };

    for record in records {
        match record {
            Ok(record) => push_row(&record, date_col, price_col, &mut points, &mut skipped),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(
            target: "holdco::prices",
            file = %path.display(),
            skipped,
            "skipped unparsable price rows"
        );
    }

    points.sort_by_key(|p| p.date);
    points.dedup_by_key(|p| p.date);
    Ok(points)
}

fn push_row(
    record: &csv::StringRecord,
    date_col: usize,
    price_col: usize,
    points: &mut Vec<PricePoint>,
    skipped: &mut usize,
) {
    let date = record.get(date_col).and_then(parse_date);
    let price = record
        .get(price_col)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|p| p.is_finite());
    match (date, price) {
        (Some(date), Some(price)) => points.push(PricePoint { date, price }),
        _ => *skipped += 1,
    }
}
