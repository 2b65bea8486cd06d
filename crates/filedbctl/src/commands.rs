//! Subcommand implementations. Each writes its normal output to `out`.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use dialoguer::{Confirm, Input};
use filedb::hash::DIGEST_HEX_LEN;
use filedb::{
    parse_range_header, ByteRange, Census, Content, DedupEngine, Digest, MetaField, ObjectId,
    ObjectRecord, Reconciler, ReconcileReport, Release,
};
use tempfile::NamedTempFile;

/// An object named on the command line, by id or by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Id(ObjectId),
    Digest(Digest),
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == DIGEST_HEX_LEN {
            return Digest::from_str_checked(s)
                .map(Target::Digest)
                .map_err(|e| e.to_string());
        }
        s.parse()
            .map(Target::Id)
            .map_err(|_| format!("not an object id or digest: {s}"))
    }
}

fn resolve(engine: &DedupEngine, target: &Target) -> Result<ObjectRecord> {
    match target {
        Target::Id(id) => Ok(engine.get(*id)?.ok_or(filedb::Error::NotFound(*id))?),
        Target::Digest(digest) => engine
            .get_by_digest(digest)?
            .with_context(|| format!("no object with digest {digest}")),
    }
}

pub fn add(engine: &DedupEngine, path: &Path, media_type: Option<&str>, out: &mut dyn Write) -> Result<()> {
    let record = if path == Path::new("-") {
        engine.add(Content::stream(io::stdin().lock()), media_type)?
    } else {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        engine.add(Content::stream(file), media_type)?
    };

    writeln!(out, "{}", record.id)?;
    Ok(())
}

pub fn get(
    engine: &DedupEngine,
    target: &Target,
    nocheck: bool,
    range: Option<&str>,
    output: Option<&Path>,
    out: &mut dyn Write,
) -> Result<()> {
    let record = resolve(engine, target)?;
    let range = match range {
        Some(header) => parse_range_header(header).with_context(|| format!("invalid range: {header}"))?,
        None => ByteRange::FULL,
    };

    let mut stream = engine.stream(record.id, range, !nocheck)?;
    if stream.range().is_partial() {
        tracing::info!(content_range = %stream.range().content_range(), "partial read");
    }

    match output {
        // Only a fully read (and verified) object replaces the destination.
        Some(path) => {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut tmp = NamedTempFile::new_in(dir)
                .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
            io::copy(&mut stream, &mut tmp)?;
            tmp.persist(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => {
            io::copy(&mut stream, out)?;
        }
    }
    Ok(())
}

pub fn meta(engine: &DedupEngine, target: &Target, field: MetaField, out: &mut dyn Write) -> Result<()> {
    let record = resolve(engine, target)?;
    writeln!(out, "{}", engine.field(record.id, field)?)?;
    Ok(())
}

pub fn retain(engine: &DedupEngine, id: ObjectId, out: &mut dyn Write) -> Result<()> {
    let record = engine.retain(id)?;
    writeln!(out, "{} references: {}", id, record.reference_count)?;
    Ok(())
}

fn print_release(id: ObjectId, release: Release, out: &mut dyn Write) -> io::Result<()> {
    match release {
        Release::Kept { reference_count } => writeln!(out, "{id} kept, references: {reference_count}"),
        Release::Deleted { blob_missing: false } => writeln!(out, "{id} deleted"),
        Release::Deleted { blob_missing: true } => writeln!(out, "{id} deleted (blob was already missing)"),
    }
}

pub fn release(engine: &DedupEngine, id: ObjectId, force: bool, out: &mut dyn Write) -> Result<()> {
    let release = engine.release(id, force)?;
    print_release(id, release, out)?;
    Ok(())
}

pub fn purge(engine: &DedupEngine, targets: &[Target], out: &mut dyn Write) -> Result<()> {
    for target in targets {
        let record = resolve(engine, target)?;
        let release = engine.purge(record.id)?;
        print_release(record.id, release, out)?;
    }
    Ok(())
}

pub fn untrack(engine: &DedupEngine, target: &Target, out: &mut dyn Write) -> Result<()> {
    let record = resolve(engine, target)?;
    let record = engine.untrack(record.id)?;
    writeln!(out, "{} untracked, blob {} left in place", record.id, record.digest)?;
    Ok(())
}

pub fn sweep(engine: &DedupEngine, out: &mut dyn Write) -> Result<()> {
    for record in engine.sweep()? {
        writeln!(out, "{} deleted ({} bytes)", record.id, record.size)?;
    }
    Ok(())
}

/// Verify objects against their digests. Fails if any are inconsistent.
pub fn check(engine: &DedupEngine, ids: &[ObjectId], out: &mut dyn Write) -> Result<()> {
    let ids = if ids.is_empty() {
        engine.list()?.into_iter().map(|r| r.id).collect()
    } else {
        ids.to_vec()
    };

    let mut bad = 0;
    for id in &ids {
        if engine.consistent(*id) {
            writeln!(out, "{id}\tok")?;
        } else {
            writeln!(out, "{id}\tINCONSISTENT")?;
            bad += 1;
        }
    }

    if bad > 0 {
        bail!("{bad} of {} objects are inconsistent", ids.len());
    }
    Ok(())
}

pub fn list(engine: &DedupEngine, json: bool, out: &mut dyn Write) -> Result<()> {
    let records = engine.list()?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &records)?;
        writeln!(out)?;
        return Ok(());
    }

    for record in records {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            record.id, record.digest, record.size, record.reference_count, record.media_type
        )?;
    }
    Ok(())
}

/// The biggest objects first.
pub fn top(engine: &DedupEngine, limit: usize, out: &mut dyn Write) -> Result<()> {
    for record in engine.largest(limit)? {
        match writeln!(out, "{} -> {} bytes", record.id, record.size) {
            Ok(()) => {}
            // Piped into `head`.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Options for `clean`.
#[derive(Debug, Clone, Copy)]
pub struct CleanOptions {
    pub simulate: bool,
    pub interactive: bool,
}

pub fn clean(engine: &DedupEngine, census_path: &Path, options: CleanOptions, out: &mut dyn Write) -> Result<()> {
    let json = std::fs::read_to_string(census_path)
        .with_context(|| format!("failed to read census {}", census_path.display()))?;
    let census = Census::from_json(&json).context("census must map object ids to reference counts")?;

    let reconciler = Reconciler::new(engine);
    if !options.interactive {
        let report = reconciler.reconcile(&census, options.simulate)?;
        print_report(&report, out)?;
        return Ok(());
    }

    let mode = if options.simulate { " (simulation)" } else { "" };
    let answer: String = Input::new()
        .with_prompt(format!("Type YES to start cleaning{mode}"))
        .allow_empty(true)
        .interact_text()?;
    if answer != "YES" {
        writeln!(out, "Aborted.")?;
        return Ok(());
    }

    // After a failed prompt every remaining record is kept.
    let mut prompt_error: Option<dialoguer::Error> = None;
    let report = reconciler.reconcile_with(&census, options.simulate, |record| {
        if prompt_error.is_some() {
            return false;
        }
        confirm_delete(record, &mut prompt_error, |prompt| {
            Confirm::new().with_prompt(prompt).default(false).interact()
        })
    })?;

    print_report(&report, out)?;
    match prompt_error {
        Some(err) => Err(err).context("confirmation prompt failed, remaining objects were kept"),
        None => Ok(()),
    }
}

/// Ask whether to delete `record`. A prompt error declines and is stashed in `error`.
fn confirm_delete<E>(
    record: &ObjectRecord,
    error: &mut Option<E>,
    ask: impl FnOnce(String) -> Result<bool, E>,
) -> bool {
    match ask(format!("Delete file {}?", record.id)) {
        Ok(answer) => answer,
        Err(err) => {
            *error = Some(err);
            false
        }
    }
}

fn print_report(report: &ReconcileReport, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "Processed: {}", report.processed)?;
    writeln!(out, "Deleted: {}", report.deleted)?;
    writeln!(out, "Kept: {}", report.kept)?;
    writeln!(out, "Updated: {}", report.updated)?;
    if report.simulated {
        writeln!(out, "Nothing was changed. Rerun with --this-is-not-a-drill to apply.")?;
    }
    Ok(())
}
