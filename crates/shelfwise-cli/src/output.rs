use std::io::Write;
use std::time::Duration;

use owo_colors::OwoColorize;
use shelfwise_core::{BookRecord, CoreError, Freshness, Origin, PrefetchOutcome, Resolved};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// One line of the `genres` listing.
#[derive(Debug, Clone)]
pub struct GenreRow {
    pub genre: String,
    pub count: usize,
    pub age: Duration,
    pub freshness: Freshness,
    /// Distinct record genres inside the bucket.
    pub contains: Vec<String>,
}

/// Human-readable age: `45s`, `12m`, `5h`, `3d`.
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0..60 => format!("{}s", secs),
        60..3600 => format!("{}m", secs / 60),
        3600..86400 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86400),
    }
}

fn stars(popularity: u8) -> String {
    let filled = usize::from(popularity.min(5));
    format!("{}{}", "*".repeat(filled), ".".repeat(5 - filled))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

/// Print a ranked list of books.
pub fn print_books(
    w: &mut dyn Write,
    genre: &str,
    books: &[BookRecord],
    color: ColorMode,
) -> std::io::Result<()> {
    if books.is_empty() {
        writeln!(w, "No books in '{}' match the current filters.", genre)?;
        return Ok(());
    }

    if color.enabled() {
        writeln!(w, "{}", format!("Top {} in {}", books.len(), genre).bold())?;
    } else {
        writeln!(w, "Top {} in {}", books.len(), genre)?;
    }
    writeln!(w)?;

    for book in books {
        let year = book
            .publication_year()
            .map(|y| y.to_string())
            .unwrap_or_else(|| "----".to_string());
        let title = truncate(book.title(), 60);
        if color.enabled() {
            writeln!(
                w,
                "{:>4}. {} ({}) {}",
                book.ranking(),
                title.bold(),
                year,
                stars(book.popularity()).yellow()
            )?;
            writeln!(
                w,
                "      {} | heat {:.1} | {}",
                book.authors_display(),
                book.heat_index(),
                book.detail_url().dimmed()
            )?;
        } else {
            writeln!(
                w,
                "{:>4}. {} ({}) {}",
                book.ranking(),
                title,
                year,
                stars(book.popularity())
            )?;
            writeln!(
                w,
                "      {} | heat {:.1} | {}",
                book.authors_display(),
                book.heat_index(),
                book.detail_url()
            )?;
        }
    }
    Ok(())
}

/// Print a single recommended book with its links.
pub fn print_recommendation(
    w: &mut dyn Write,
    book: &BookRecord,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", "You might enjoy:".green(), book.title().bold())?;
    } else {
        writeln!(w, "You might enjoy: {}", book.title())?;
    }
    writeln!(w, "  by {}", book.authors_display())?;
    let year = book
        .publication_year()
        .map(|y| format!(", first published {}", y))
        .unwrap_or_default();
    writeln!(w, "  genre: {}{}", book.genre(), year)?;
    writeln!(
        w,
        "  popularity {} | heat {:.1}",
        stars(book.popularity()),
        book.heat_index()
    )?;
    writeln!(w, "  {}", book.detail_url())?;
    if let Some(cover) = book.cover_url() {
        writeln!(w, "  cover: {}", cover)?;
    }
    Ok(())
}

/// Warn when results come from a stale cache entry; note cache hits.
pub fn print_origin_notice(
    w: &mut dyn Write,
    resolved: &Resolved,
    now: u64,
    color: ColorMode,
) -> std::io::Result<()> {
    let age = format_age(Duration::from_secs(now.saturating_sub(resolved.fetched_at)));
    match &resolved.origin {
        Origin::StaleFallback { reason } => {
            let msg = format!(
                "Could not refresh '{}' ({}); showing results cached {} ago.",
                resolved.genre_key, reason, age
            );
            if color.enabled() {
                writeln!(w, "{} {}", "WARNING:".yellow(), msg)?;
            } else {
                writeln!(w, "WARNING: {}", msg)?;
            }
        }
        Origin::Cache => {
            let msg = format!("(cached {} ago)", age);
            if color.enabled() {
                writeln!(w, "{}", msg.dimmed())?;
            } else {
                writeln!(w, "{}", msg)?;
            }
        }
        Origin::Fetched => {}
    }
    Ok(())
}

/// Print a user-facing explanation for a core error.
pub fn print_core_error(
    w: &mut dyn Write,
    err: &CoreError,
    color: ColorMode,
) -> std::io::Result<()> {
    let msg = match err {
        CoreError::FetchUnavailable { genre, source } => format!(
            "Couldn't load books for '{}': {}. Nothing is cached yet; check your connection and try again.",
            genre, source
        ),
        CoreError::EmptyPool => {
            "No books to pick from. Try another genre or run `shelfwise refresh`.".to_string()
        }
        CoreError::Validation(detail) => format!("Invalid input: {}", detail),
        CoreError::Storage(e) => format!("Cache storage problem: {}", e),
    };
    if color.enabled() {
        writeln!(w, "{} {}", "ERROR:".red(), msg)
    } else {
        writeln!(w, "ERROR: {}", msg)
    }
}

/// Print one line per genre after a refresh.
pub fn print_prefetch_summary(
    w: &mut dyn Write,
    outcomes: &[PrefetchOutcome],
    color: ColorMode,
) -> std::io::Result<()> {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.result {
            Ok(resolved) if resolved.is_stale_fallback() => {
                failed += 1;
                let label = "KEPT STALE";
                if color.enabled() {
                    writeln!(
                        w,
                        "{:<20} {} ({} books)",
                        outcome.genre_key,
                        label.yellow(),
                        resolved.records.len()
                    )?;
                } else {
                    writeln!(
                        w,
                        "{:<20} {} ({} books)",
                        outcome.genre_key,
                        label,
                        resolved.records.len()
                    )?;
                }
            }
            Ok(resolved) => {
                let dropped = resolved.report.map(|r| r.dropped()).unwrap_or(0);
                let suffix = if dropped > 0 {
                    format!(", {} dropped", dropped)
                } else {
                    String::new()
                };
                if color.enabled() {
                    writeln!(
                        w,
                        "{:<20} {} ({} books{})",
                        outcome.genre_key,
                        "OK".green(),
                        resolved.records.len(),
                        suffix
                    )?;
                } else {
                    writeln!(
                        w,
                        "{:<20} OK ({} books{})",
                        outcome.genre_key,
                        resolved.records.len(),
                        suffix
                    )?;
                }
            }
            Err(e) => {
                failed += 1;
                if color.enabled() {
                    writeln!(w, "{:<20} {} {}", outcome.genre_key, "FAILED".red(), e)?;
                } else {
                    writeln!(w, "{:<20} FAILED {}", outcome.genre_key, e)?;
                }
            }
        }
    }
    writeln!(w)?;
    writeln!(
        w,
        "Refreshed {}/{} genres",
        outcomes.len() - failed,
        outcomes.len()
    )?;
    Ok(())
}

/// Print cached genres with size, age and freshness.
pub fn print_genre_table(
    w: &mut dyn Write,
    rows: &[GenreRow],
    color: ColorMode,
) -> std::io::Result<()> {
    if rows.is_empty() {
        writeln!(w, "Nothing cached yet. Run `shelfwise refresh` to fetch the default genres.")?;
        return Ok(());
    }
    writeln!(w, "{:<20} {:>6} {:>6}  STATUS", "GENRE", "BOOKS", "AGE")?;
    for row in rows {
        let status = match row.freshness {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Missing => "missing",
        };
        let status = match (color.enabled(), row.freshness) {
            (false, _) => status.to_string(),
            (true, Freshness::Fresh) => status.green().to_string(),
            (true, _) => status.yellow().to_string(),
        };
        let age = format_age(row.age);
        writeln!(w, "{:<20} {:>6} {:>6}  {}", row.genre, row.count, age, status)?;

        // Mixed buckets ("Any") list what they hold.
        if row.contains.iter().any(|g| !g.eq_ignore_ascii_case(&row.genre)) {
            let mut shown: Vec<&str> = row.contains.iter().take(6).map(String::as_str).collect();
            if row.contains.len() > shown.len() {
                shown.push("...");
            }
            let line = format!("  includes: {}", shown.join(", "));
            if color.enabled() {
                writeln!(w, "{}", line.dimmed())?;
            } else {
                writeln!(w, "{}", line)?;
            }
        }
    }
    Ok(())
}
