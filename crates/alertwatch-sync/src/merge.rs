//! Cross-source identity resolution.
//!
//! Every incoming record is matched against the working set (the existing
//! snapshot, followed by records added earlier in the same batch) in three
//! tiers: equal normalized reference, equal identity hash, then fuzzy title
//! similarity inside a date window. The first tier with a candidate decides.

use std::cmp::Ordering;

use alertwatch_core::{
    comparison_form, AlertDetails, AlertFields, AlertRecord, ChangeEntry, FieldChange, FieldConflict,
    MatchTier, SourceKind,
};
use chrono::{DateTime, NaiveDate, Utc};
use strsim::normalized_levenshtein;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeConfig {
    /// Normalized Levenshtein similarity of title comparison forms must exceed this.
    pub fuzzy_threshold: f64,
    pub date_tolerance_days: i64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            date_tolerance_days: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Existing records in their original order, revised in place, then new ones.
    pub records: Vec<AlertRecord>,
    /// One entry per incoming record, in input order.
    pub report: Vec<ChangeEntry>,
}

pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> MergeConfig {
        self.config
    }

    pub fn reconcile(&self, existing: &[AlertRecord], incoming: Vec<AlertRecord>) -> MergeOutcome {
        let mut working = existing.to_vec();
        let mut report = Vec::with_capacity(incoming.len());

        for record in incoming {
            let Some((index, tier)) = self.find_match(&working, &record) else {
                debug!(hash = record.identity_hash(), title = record.title(), "new alert");
                working.push(record.clone());
                report.push(ChangeEntry::New { record });
                continue;
            };

            let current = &working[index];
            let (merged, conflicts) = merge_pair(current, &record);
            if merged == *current {
                report.push(ChangeEntry::Duplicate {
                    existing: current.clone(),
                    matched_by: tier,
                    conflicts,
                });
                continue;
            }

            let changed_fields = field_changes(current.fields(), merged.fields());
            debug!(
                hash = merged.identity_hash(),
                tier = ?tier,
                changed = changed_fields.len(),
                "updated alert"
            );
            report.push(ChangeEntry::Update {
                previous: current.clone(),
                current: merged.clone(),
                matched_by: tier,
                changed_fields,
                conflicts,
            });
            working[index] = merged;
        }

        MergeOutcome {
            records: working,
            report,
        }
    }

    fn find_match(&self, working: &[AlertRecord], incoming: &AlertRecord) -> Option<(usize, MatchTier)> {
        let incoming_ref = normalized_reference(incoming);

        if let Some(reference) = &incoming_ref {
            let candidates = working
                .iter()
                .enumerate()
                .filter(|(_, candidate)| normalized_reference(candidate).as_ref() == Some(reference))
                .map(|(index, _)| (index, 1.0));
            if let Some(index) = pick(working, candidates) {
                return Some((index, MatchTier::Reference));
            }
        }

        let candidates = working
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.identity_hash() == incoming.identity_hash())
            .map(|(index, _)| (index, 1.0));
        if let Some(index) = pick(working, candidates) {
            return Some((index, MatchTier::IdentityHash));
        }

        let title = comparison_form(incoming.title());
        if title.is_empty() {
            return None;
        }
        let candidates = working
            .iter()
            .enumerate()
            .filter(|(_, candidate)| {
                within_days(candidate.issue_date(), incoming.issue_date(), self.config.date_tolerance_days)
            })
            .filter(|(_, candidate)| {
                match (normalized_reference(candidate), &incoming_ref) {
                    (Some(a), Some(b)) => a == *b,
                    _ => true,
                }
            })
            .filter(|(_, candidate)| !distinct_pages_of_one_source(candidate, incoming))
            .filter_map(|(index, candidate)| {
                let other = comparison_form(candidate.title());
                (!other.is_empty()).then(|| (index, normalized_levenshtein(&other, &title)))
            })
            .filter(|(_, score)| *score > self.config.fuzzy_threshold);
        pick(working, candidates).map(|index| (index, MatchTier::Fuzzy))
    }
}

/// One source never publishes the same alert under two detail pages.
fn distinct_pages_of_one_source(a: &AlertRecord, b: &AlertRecord) -> bool {
    let (x, y) = (a.fields().url.trim(), b.fields().url.trim());
    a.source() == b.source() && !x.is_empty() && !y.is_empty() && x != y
}

fn normalized_reference(record: &AlertRecord) -> Option<String> {
    record
        .reference()
        .map(comparison_form)
        .filter(|r| !r.is_empty())
}

fn within_days(a: NaiveDate, b: NaiveDate, tolerance: i64) -> bool {
    (a - b).num_days().abs() <= tolerance
}

type TieKey<'a> = (
    &'a str,
    NaiveDate,
    String,
    &'a str,
    Option<&'a str>,
    &'a str,
    &'a str,
    &'a str,
    Option<&'a str>,
    SourceKind,
    DateTime<Utc>,
);

/// Content-based ordering so that the winner never depends on where a
/// candidate sits in the snapshot. Only fully identical records fall through
/// to the index.
fn tie_key(record: &AlertRecord) -> TieKey<'_> {
    let f = record.fields();
    (
        record.identity_hash(),
        f.issue_date,
        comparison_form(&f.title),
        f.url.as_str(),
        f.reference.as_deref(),
        f.originator.as_str(),
        f.status.as_str(),
        f.alert_type.as_str(),
        f.medical_specialty.as_deref(),
        f.source,
        record.scraped_at(),
    )
}

/// Highest score wins; ties go to the lowest tie key, then the lowest index.
fn pick(working: &[AlertRecord], candidates: impl Iterator<Item = (usize, f64)>) -> Option<usize> {
    candidates
        .min_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| tie_key(&working[*ia]).cmp(&tie_key(&working[*ib])))
                .then_with(|| ia.cmp(ib))
        })
        .map(|(index, _)| index)
}

struct FieldMerger<'a> {
    existing: &'a AlertRecord,
    incoming: &'a AlertRecord,
    incoming_wins: bool,
    conflicts: Vec<FieldConflict>,
}

impl<'a> FieldMerger<'a> {
    fn text(&mut self, field: &str, existing: Option<&str>, incoming: Option<&str>) -> Option<String> {
        self.text_with(field, existing, incoming, self.incoming_wins)
    }

    fn text_with(
        &mut self,
        field: &str,
        existing: Option<&str>,
        incoming: Option<&str>,
        incoming_wins: bool,
    ) -> Option<String> {
        match (present(existing), present(incoming)) {
            (Some(kept), Some(offered)) if comparison_form(kept) != comparison_form(offered) => {
                if incoming_wins {
                    self.conflict(field, offered, kept, self.existing.source());
                    Some(offered.to_string())
                } else {
                    self.conflict(field, kept, offered, self.incoming.source());
                    Some(kept.to_string())
                }
            }
            (None, Some(offered)) => Some(offered.to_string()),
            _ => existing.map(str::to_string),
        }
    }

    fn list(&mut self, field: &str, existing: &[String], incoming: &[String]) -> Vec<String> {
        let joined = |items: &[String]| (!items.is_empty()).then(|| items.join("; "));
        let (kept, offered) = (joined(existing), joined(incoming));
        match (kept, offered) {
            (Some(kept), Some(offered)) if comparison_form(&kept) != comparison_form(&offered) => {
                if self.incoming_wins {
                    self.conflict(field, &offered, &kept, self.existing.source());
                    incoming.to_vec()
                } else {
                    self.conflict(field, &kept, &offered, self.incoming.source());
                    existing.to_vec()
                }
            }
            (None, Some(_)) => incoming.to_vec(),
            _ => existing.to_vec(),
        }
    }

    fn details(&mut self, existing: &AlertDetails, incoming: &AlertDetails) -> AlertDetails {
        AlertDetails {
            action_category: self.text(
                "action_category",
                existing.action_category.as_deref(),
                incoming.action_category.as_deref(),
            ),
            broadcast_content: self.text(
                "broadcast_content",
                existing.broadcast_content.as_deref(),
                incoming.broadcast_content.as_deref(),
            ),
            additional_info: self.text(
                "additional_info",
                existing.additional_info.as_deref(),
                incoming.additional_info.as_deref(),
            ),
            action_underway_deadline: self.text(
                "action_underway_deadline",
                existing.action_underway_deadline.as_deref(),
                incoming.action_underway_deadline.as_deref(),
            ),
            action_complete_deadline: self.text(
                "action_complete_deadline",
                existing.action_complete_deadline.as_deref(),
                incoming.action_complete_deadline.as_deref(),
            ),
            attachments: self.list("attachments", &existing.attachments, &incoming.attachments),
        }
    }

    fn date(&mut self) -> NaiveDate {
        let kept = self.existing.issue_date();
        let offered = self.incoming.issue_date();
        if kept == offered {
            kept
        } else if self.incoming_wins {
            self.conflict("issue_date", &offered.to_string(), &kept.to_string(), self.existing.source());
            offered
        } else {
            self.conflict("issue_date", &kept.to_string(), &offered.to_string(), self.incoming.source());
            kept
        }
    }

    fn conflict(&mut self, field: &str, kept: &str, discarded: &str, discarded_source: SourceKind) {
        self.conflicts.push(FieldConflict {
            field: field.to_string(),
            kept: kept.to_string(),
            discarded: discarded.to_string(),
            discarded_source,
        });
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Field-level precedence: empty never overwrites a value, empty values are
/// filled, and a disagreement goes to the incoming side only when it is a
/// re-scrape of the record's own source. Identity, source, `scraped_at` and a
/// present reference always stay.
fn merge_pair(existing: &AlertRecord, incoming: &AlertRecord) -> (AlertRecord, Vec<FieldConflict>) {
    let e = existing.fields();
    let i = incoming.fields();
    let mut m = FieldMerger {
        existing,
        incoming,
        incoming_wins: incoming.source() == existing.source(),
        conflicts: Vec::new(),
    };

    let reference = m.text_with("reference", e.reference.as_deref(), i.reference.as_deref(), false);
    let title = m
        .text("title", Some(e.title.as_str()), Some(i.title.as_str()))
        .unwrap_or_else(|| e.title.clone());
    let originator = m
        .text("originator", Some(e.originator.as_str()), Some(i.originator.as_str()))
        .unwrap_or_else(|| e.originator.clone());
    let issue_date = m.date();
    let status = m
        .text("status", Some(e.status.as_str()), Some(i.status.as_str()))
        .unwrap_or_else(|| e.status.clone());
    let alert_type = m
        .text("alert_type", Some(e.alert_type.as_str()), Some(i.alert_type.as_str()))
        .unwrap_or_else(|| e.alert_type.clone());
    let url = m
        .text("url", Some(e.url.as_str()), Some(i.url.as_str()))
        .unwrap_or_else(|| e.url.clone());
    let medical_specialty = m.text(
        "medical_specialty",
        e.medical_specialty.as_deref(),
        i.medical_specialty.as_deref(),
    );
    let details = m.details(&e.details, &i.details);

    let merged = existing.revise(AlertFields {
        reference,
        title,
        originator,
        issue_date,
        status,
        alert_type,
        source: e.source,
        url,
        medical_specialty,
        details,
    });
    (merged, m.conflicts)
}

fn field_changes(before: &AlertFields, after: &AlertFields) -> Vec<FieldChange> {
    let date = |d: NaiveDate| Some(d.format("%Y-%m-%d").to_string());
    let attachments = |f: &AlertFields| {
        (!f.details.attachments.is_empty()).then(|| f.details.attachments.join("; "))
    };
    let (bd, ad) = (&before.details, &after.details);
    [
        ("reference", before.reference.clone(), after.reference.clone()),
        ("title", Some(before.title.clone()), Some(after.title.clone())),
        ("originator", Some(before.originator.clone()), Some(after.originator.clone())),
        ("issue_date", date(before.issue_date), date(after.issue_date)),
        ("status", Some(before.status.clone()), Some(after.status.clone())),
        ("alert_type", Some(before.alert_type.clone()), Some(after.alert_type.clone())),
        ("url", Some(before.url.clone()), Some(after.url.clone())),
        (
            "medical_specialty",
            before.medical_specialty.clone(),
            after.medical_specialty.clone(),
        ),
        ("action_category", bd.action_category.clone(), ad.action_category.clone()),
        ("broadcast_content", bd.broadcast_content.clone(), ad.broadcast_content.clone()),
        ("additional_info", bd.additional_info.clone(), ad.additional_info.clone()),
        (
            "action_underway_deadline",
            bd.action_underway_deadline.clone(),
            ad.action_underway_deadline.clone(),
        ),
        (
            "action_complete_deadline",
            bd.action_complete_deadline.clone(),
            ad.action_complete_deadline.clone(),
        ),
        ("attachments", attachments(before), attachments(after)),
    ]
    .into_iter()
    .filter(|(_, previous, current)| previous != current)
    .map(|(field, previous, current)| FieldChange {
        field: field.to_string(),
        previous,
        current,
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertwatch_core::{ChangeCounts, ChangeKind};
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 7, 0, 0).single().unwrap()
    }

    fn cas(reference: &str, title: &str, day: u32) -> AlertRecord {
        AlertRecord::new(
            AlertFields {
                reference: Some(reference.to_string()),
                title: title.to_string(),
                originator: "National Patient Safety Alert".to_string(),
                issue_date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
                status: "Active".to_string(),
                alert_type: "National Patient Safety Alert".to_string(),
                source: SourceKind::CasPortal,
                url: format!("https://www.cas.mhra.gov.uk/ViewAlert.aspx?ref={reference}"),
                medical_specialty: None,
                details: AlertDetails::default(),
            },
            at(14),
        )
    }

    fn govuk(title: &str, day: u32, specialty: Option<&str>) -> AlertRecord {
        AlertRecord::new(
            AlertFields {
                reference: Some(String::new()),
                title: title.to_string(),
                originator: "MHRA/GOV.UK".to_string(),
                issue_date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
                status: "Issued".to_string(),
                alert_type: "Medical device safety information".to_string(),
                source: SourceKind::GovUk,
                url: "https://www.gov.uk/drug-device-alerts/xyz-infusion-pump".to_string(),
                medical_specialty: specialty.map(str::to_string),
                details: AlertDetails::default(),
            },
            at(15),
        )
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(MergeConfig::default())
    }

    fn kinds(report: &[ChangeEntry]) -> Vec<ChangeKind> {
        report.iter().map(ChangeEntry::kind).collect()
    }

    #[test]
    fn fuzzy_title_match_across_sources_updates_and_keeps_the_reference() {
        let existing = vec![cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12)];
        let incoming = vec![govuk("Recall of XYZ infusion pump, model 200", 12, Some("Anaesthetics"))];

        let outcome = engine().reconcile(&existing, incoming);
        assert_eq!(outcome.records.len(), 1);
        let ChangeEntry::Update {
            previous,
            current,
            matched_by,
            changed_fields,
            conflicts,
        } = &outcome.report[0]
        else {
            panic!("expected update, got {:?}", outcome.report[0]);
        };
        assert_eq!(*matched_by, MatchTier::Fuzzy);
        assert_eq!(current.reference(), Some("MDA/2024/010"));
        assert_eq!(current.fields().medical_specialty.as_deref(), Some("Anaesthetics"));
        assert_eq!(current.identity_hash(), previous.identity_hash());
        assert_eq!(current.source(), SourceKind::CasPortal);
        assert_eq!(current.title(), "Recall of XYZ Infusion Pump Model 200");
        assert_eq!(changed_fields.len(), 1);
        assert_eq!(changed_fields[0].field, "medical_specialty");
        assert!(conflicts
            .iter()
            .any(|c| c.field == "status" && c.kept == "Active" && c.discarded == "Issued"));
        assert!(conflicts.iter().all(|c| c.discarded_source == SourceKind::GovUk));
        assert_eq!(outcome.records[0], *current);
    }

    #[test]
    fn shared_reference_with_identical_fields_is_a_duplicate() {
        let existing = vec![cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12)];
        let mut twin = existing[0].fields().clone();
        twin.source = SourceKind::GovUk;
        let incoming = vec![AlertRecord::new(twin, at(15))];

        let outcome = engine().reconcile(&existing, incoming);
        assert!(matches!(
            &outcome.report[0],
            ChangeEntry::Duplicate { matched_by: MatchTier::Reference, conflicts, .. } if conflicts.is_empty()
        ));
        assert_eq!(outcome.records, existing);
    }

    #[test]
    fn rescrape_of_the_same_source_takes_the_new_status() {
        let existing = vec![cas("NatPSA/2024/001", "Oxygen cylinder valve failure", 12)];
        let mut withdrawn = existing[0].fields().clone();
        withdrawn.status = "Withdrawn".to_string();
        let incoming = vec![AlertRecord::new(withdrawn, at(16))];

        let outcome = engine().reconcile(&existing, incoming);
        let ChangeEntry::Update { current, changed_fields, .. } = &outcome.report[0] else {
            panic!("expected update");
        };
        assert_eq!(current.fields().status, "Withdrawn");
        assert_eq!(current.scraped_at(), existing[0].scraped_at());
        assert_eq!(changed_fields[0].previous.as_deref(), Some("Active"));
    }

    #[test]
    fn empty_values_never_overwrite() {
        let existing = vec![govuk("Insulin pen needle recall", 12, Some("Diabetes"))];
        let incoming = vec![govuk("Insulin pen needle recall", 12, None)];
        let outcome = engine().reconcile(&existing, incoming);
        assert_eq!(kinds(&outcome.report), vec![ChangeKind::Duplicate]);
        assert_eq!(outcome.records, existing);
    }

    #[test]
    fn fuzzy_matching_respects_the_date_window_and_conflicting_references() {
        let existing = vec![cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12)];

        let far = engine().reconcile(&existing, vec![govuk("Recall of XYZ infusion pump model 200", 15, None)]);
        assert_eq!(kinds(&far.report), vec![ChangeKind::New]);

        let other_ref = engine().reconcile(&existing, vec![cas("MDA/2024/011", "Recall of XYZ Infusion Pump Model 200", 12)]);
        assert_eq!(kinds(&other_ref.report), vec![ChangeKind::New]);
        assert_eq!(other_ref.records.len(), 2);

        let loose = MergeEngine::new(MergeConfig {
            fuzzy_threshold: 0.85,
            date_tolerance_days: 5,
        });
        let near = loose.reconcile(&existing, vec![govuk("Recall of XYZ infusion pump model 200", 15, None)]);
        assert_eq!(kinds(&near.report), vec![ChangeKind::Duplicate]);
    }

    #[test]
    fn same_alert_from_both_sources_in_one_batch_merges() {
        let incoming = vec![
            cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12),
            govuk("Recall of XYZ infusion pump, model 200", 12, Some("Anaesthetics")),
        ];
        let outcome = engine().reconcile(&[], incoming);
        assert_eq!(kinds(&outcome.report), vec![ChangeKind::New, ChangeKind::Update]);
        assert_eq!(outcome.records.len(), 1);
    }

    #[test]
    fn second_run_over_the_same_batch_is_all_duplicates() {
        let existing = vec![
            cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12),
            cas("NatPSA/2024/001", "Oxygen cylinder valve failure", 11),
        ];
        let batch = vec![
            govuk("Recall of XYZ infusion pump, model 200", 12, Some("Anaesthetics")),
            cas("NatPSA/2024/001", "Oxygen cylinder valve failure", 11),
            cas("MDA/2024/020", "Defibrillator battery depletion", 13),
            govuk("Blood glucose test strips: false high readings", 13, None),
        ];

        let first = engine().reconcile(&existing, batch.clone());
        let second = engine().reconcile(&first.records, batch);
        assert_eq!(ChangeCounts::tally(&second.report).duplicate, 4);
        assert_eq!(second.records, first.records);
    }

    #[test]
    fn permuting_the_snapshot_does_not_change_classification() {
        let existing = vec![
            cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12),
            govuk("Recall of XYZ infusion pump model 200", 12, None),
            govuk("Recall of XYZ infusion pump model 2000", 12, Some("Anaesthetics")),
            cas("NatPSA/2024/001", "Oxygen cylinder valve failure", 11),
        ];
        let batch = vec![
            govuk("Recall of XYZ infusion pump, model 200", 13, Some("Cardiology")),
            cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12),
            govuk("Oxygen cylinder valve failures", 11, None),
        ];

        let baseline = engine().reconcile(&existing, batch.clone());
        let mut permuted = existing.clone();
        permuted.reverse();
        permuted.swap(0, 2);
        let other = engine().reconcile(&permuted, batch);

        assert_eq!(kinds(&baseline.report), kinds(&other.report));
        for (a, b) in baseline.report.iter().zip(&other.report) {
            assert_eq!(a.resolved().identity_hash(), b.resolved().identity_hash());
        }
    }

    fn govuk_at(title: &str, slug: &str) -> AlertRecord {
        let mut fields = govuk(title, 12, None).fields().clone();
        fields.url = format!("https://www.gov.uk/drug-device-alerts/{slug}");
        AlertRecord::new(fields, at(15))
    }

    #[test]
    fn near_identical_titles_on_distinct_pages_of_one_source_stay_apart() {
        let batch = vec![
            govuk_at("Class 2 Medicines Recall: Paracetamol 500mg tablets, batch A1", "recall-a1"),
            govuk_at("Class 2 Medicines Recall: Paracetamol 500mg tablets, batch B2", "recall-b2"),
        ];

        let first = engine().reconcile(&[], batch.clone());
        assert_eq!(kinds(&first.report), vec![ChangeKind::New, ChangeKind::New]);
        assert_eq!(first.records.len(), 2);
        assert!(first.records[0].title().ends_with("batch A1"));
        assert!(first.records[0].fields().url.ends_with("recall-a1"));

        let second = engine().reconcile(&first.records, batch);
        assert_eq!(kinds(&second.report), vec![ChangeKind::Duplicate, ChangeKind::Duplicate]);
        assert_eq!(second.records, first.records);
    }

    #[test]
    fn the_fuzzy_threshold_must_be_exceeded() {
        let existing = vec![cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12)];
        let incoming = || vec![govuk("Recall of XYZ Infusion Pump Model 200", 13, None)];

        let strict = MergeEngine::new(MergeConfig {
            fuzzy_threshold: 1.0,
            date_tolerance_days: 1,
        });
        assert_eq!(kinds(&strict.reconcile(&existing, incoming()).report), vec![ChangeKind::New]);

        let lenient = MergeEngine::new(MergeConfig {
            fuzzy_threshold: 0.99,
            date_tolerance_days: 1,
        });
        let matched = lenient.reconcile(&existing, incoming());
        assert_ne!(kinds(&matched.report), vec![ChangeKind::New]);
    }

    #[test]
    fn punctuation_only_titles_never_fuzzy_match() {
        let existing = vec![cas("MDA/2024/010", "***", 12)];
        let outcome = engine().reconcile(&existing, vec![govuk("---", 12, None)]);
        assert_eq!(kinds(&outcome.report), vec![ChangeKind::New]);
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn detail_content_fills_gaps_and_cross_source_disagreement_is_recorded() {
        let mut with_details = cas("MDA/2024/010", "Recall of XYZ Infusion Pump Model 200", 12)
            .fields()
            .clone();
        with_details.details.action_category = Some("Action required".to_string());
        let existing = vec![AlertRecord::new(with_details, at(14))];

        let mut offered = govuk("Recall of XYZ infusion pump, model 200", 12, None).fields().clone();
        offered.details.action_category = Some("For information".to_string());
        offered.details.attachments = vec!["Field safety notice (https://x.test/fsn.pdf)".to_string()];
        let outcome = engine().reconcile(&existing, vec![AlertRecord::new(offered, at(15))]);

        let ChangeEntry::Update { current, changed_fields, conflicts, .. } = &outcome.report[0] else {
            panic!("expected update, got {:?}", outcome.report[0]);
        };
        let details = &current.fields().details;
        assert_eq!(details.action_category.as_deref(), Some("Action required"));
        assert_eq!(details.attachments.len(), 1);
        assert!(changed_fields.iter().any(|c| c.field == "attachments"));
        assert!(conflicts
            .iter()
            .any(|c| c.field == "action_category" && c.discarded == "For information"));
    }
}
