//! Alert detail pages. Both sources link every listing row to a page of its
//! own that carries more than the listing shows.

use alertwatch_core::{AlertDetails, AlertDraft};
use alertwatch_storage::PageTransport;
use scraper::{ElementRef, Html};
use tracing::{debug, warn};

use crate::{element_text, resolve_url, selector, text_or_none, AdapterContext, RequestPacer};

const CAS_ORIGINATOR: &str = "Originator:";
const CAS_ACTION_CATEGORY: &str = "Action category:";
const CAS_BROADCAST: &str = "Broadcast content:";
const CAS_ADDITIONAL_INFO: &str = "Additional information:";
const CAS_UNDERWAY_DEADLINE: &str = "Action underway deadline:";
const CAS_COMPLETE_DEADLINE: &str = "Action complete deadline:";
const CAS_ATTACHMENTS: &str = "Attachments:";

/// What a detail page adds to or overrides on its listing draft.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailPage {
    pub title: Option<String>,
    pub issue_date: Option<String>,
    pub reference: Option<String>,
    pub originator: Option<String>,
    pub details: AlertDetails,
}

impl DetailPage {
    pub fn apply_to(self, draft: &mut AlertDraft) {
        if let Some(title) = self.title {
            draft.title = Some(title);
        }
        if let Some(issue_date) = self.issue_date {
            draft.issue_date = Some(issue_date);
        }
        if let Some(reference) = self.reference {
            draft.reference = Some(reference);
        }
        if let Some(originator) = self.originator {
            draft.originator = Some(originator);
        }
        draft.details = self.details;
    }
}

/// One paced detail request. `None` when the deadline has passed or the
/// request failed; the listing draft is then kept as it is.
pub(crate) async fn fetch_detail_body(
    transport: &dyn PageTransport,
    pacer: &mut RequestPacer,
    ctx: &AdapterContext,
    source_id: &str,
    url: &str,
) -> Option<String> {
    pacer.wait_turn().await;
    if ctx.deadline.is_past() {
        debug!(source_id, url, "deadline reached; skipping detail page");
        return None;
    }
    match transport.get(source_id, url).await {
        Ok(response) => {
            ctx.archive_page(source_id, "detail", &response.body).await;
            Some(response.text())
        }
        Err(err) => {
            warn!(source_id, url, error = %err, "failed to fetch detail page");
            None
        }
    }
}

fn block_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn attachment(link: ElementRef<'_>, page_url: &str) -> Option<String> {
    let href = link.value().attr("href")?;
    let target = resolve_url(page_url, href).unwrap_or_else(|| href.trim().to_string());
    Some(format!("{} ({target})", element_text(link)))
}

/// The element right after the one whose own text holds `label`.
fn value_after_label<'a>(document: &'a Html, label: &str) -> Option<ElementRef<'a>> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| {
            el.children()
                .filter_map(|child| child.value().as_text())
                .any(|text| text.contains(label))
        })?
        .next_siblings()
        .find_map(ElementRef::wrap)
}

/// CAS pages lay out `label: value` pairs as sibling elements.
pub fn parse_cas_detail(html: &str, page_url: &str) -> Result<DetailPage, String> {
    let document = Html::parse_document(html);
    let field = |label: &str| value_after_label(&document, label).map(element_text).and_then(text_or_none);
    let links = selector("a[href]")?;

    let attachments = value_after_label(&document, CAS_ATTACHMENTS)
        .map(|section| {
            section
                .select(&links)
                .filter_map(|link| attachment(link, page_url))
                .collect()
        })
        .unwrap_or_default();

    Ok(DetailPage {
        originator: field(CAS_ORIGINATOR),
        details: AlertDetails {
            action_category: field(CAS_ACTION_CATEGORY),
            broadcast_content: value_after_label(&document, CAS_BROADCAST)
                .map(block_text)
                .filter(|t| !t.is_empty()),
            additional_info: field(CAS_ADDITIONAL_INFO),
            action_underway_deadline: field(CAS_UNDERWAY_DEADLINE),
            action_complete_deadline: field(CAS_COMPLETE_DEADLINE),
            attachments,
        },
        ..DetailPage::default()
    })
}

/// First `DMRC` reference in `text`, e.g. `DMRC-12345`, `DMRC 12345`, `DMRC12345`.
pub fn dmrc_reference(text: &str) -> Option<String> {
    text.match_indices("DMRC").find_map(|(start, _)| {
        let rest = &text[start + 4..];
        let separator = rest
            .chars()
            .next()
            .filter(|c| matches!(c, '-' | ' ' | ':'))
            .map_or(0, char::len_utf8);
        let digits = rest[separator..].chars().take_while(char::is_ascii_digit).count();
        (digits > 0).then(|| text[start..start + 4 + separator + digits].to_string())
    })
}

/// Text of the siblings following the first `h2`/`h3` that mentions `label`,
/// up to the next heading.
fn section(document: &Html, headings: &scraper::Selector, label: &str) -> Option<String> {
    let wanted = label.to_lowercase();
    let heading = document
        .select(headings)
        .find(|h| element_text(*h).to_lowercase().contains(&wanted))?;
    let text = heading
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .take_while(|sib| !matches!(sib.value().name(), "h2" | "h3"))
        .map(block_text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}

pub fn parse_govuk_detail(html: &str, page_url: &str) -> Result<DetailPage, String> {
    let document = Html::parse_document(html);
    let h1 = selector("h1")?;
    let published = selector(r#"time[data-module="govuk-datetime"]"#)?;
    let headings = selector("h2, h3")?;
    let links = selector("a[href]")?;

    let title = document.select(&h1).next().map(element_text).and_then(text_or_none);
    let issue_date = document
        .select(&published)
        .next()
        .and_then(|time| time.value().attr("datetime"))
        .and_then(|datetime| datetime.get(..10))
        .map(str::to_string);
    let reference = dmrc_reference(&block_text(document.root_element()));

    let attachments = document
        .select(&links)
        .filter(|link| {
            let text = element_text(*link).to_lowercase();
            let href = link.value().attr("href").unwrap_or_default();
            text.contains("download") || href.ends_with(".pdf")
        })
        .filter_map(|link| attachment(link, page_url))
        .collect();

    Ok(DetailPage {
        title,
        issue_date,
        reference,
        originator: None,
        details: AlertDetails {
            action_category: section(&document, &headings, "Advice for Healthcare Professionals"),
            broadcast_content: section(&document, &headings, "Background"),
            additional_info: section(&document, &headings, "Additional information"),
            attachments,
            ..AlertDetails::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cas_detail_page, govuk_detail_page};

    const CAS_URL: &str = "https://www.cas.mhra.gov.uk/ViewandAcknowledgment/ViewAlert.aspx?AlertID=100";
    const GOVUK_URL: &str = "https://www.gov.uk/drug-device-alerts/infusion-pump-risk";

    #[test]
    fn cas_labels_map_to_detail_fields() {
        let page = parse_cas_detail(&cas_detail_page(), CAS_URL).unwrap();
        assert_eq!(page.originator.as_deref(), Some("Medicines and Healthcare products Regulatory Agency"));
        assert_eq!(page.title, None);
        let details = &page.details;
        assert_eq!(details.action_category.as_deref(), Some("Action required"));
        assert_eq!(
            details.broadcast_content.as_deref(),
            Some("Stop using affected pumps.\nQuarantine stock.")
        );
        assert_eq!(details.additional_info.as_deref(), Some("See the manufacturer notice."));
        assert_eq!(details.action_underway_deadline.as_deref(), Some("19-Mar-2024"));
        assert_eq!(details.action_complete_deadline.as_deref(), Some("30-Apr-2024"));
        assert_eq!(
            details.attachments,
            vec!["Field safety notice (https://www.cas.mhra.gov.uk/Docs/fsn-100.pdf)".to_string()]
        );
    }

    #[test]
    fn cas_page_without_labels_yields_nothing() {
        let page = parse_cas_detail("<html><body><p>Alert</p></body></html>", CAS_URL).unwrap();
        assert_eq!(page, DetailPage::default());
    }

    #[test]
    fn govuk_page_overrides_title_date_and_reference() {
        let page = parse_govuk_detail(&govuk_detail_page(), GOVUK_URL).unwrap();
        assert_eq!(page.title.as_deref(), Some("Infusion pump: risk of over-infusion (DSI/2024/004)"));
        assert_eq!(page.issue_date.as_deref(), Some("2024-03-12"));
        assert_eq!(page.reference.as_deref(), Some("DMRC-31337"));
        let details = &page.details;
        assert_eq!(details.broadcast_content.as_deref(), Some("Pumps may over-infuse.\nBatch 2 affected."));
        assert_eq!(details.action_category.as_deref(), Some("Check the pump model."));
        assert_eq!(details.additional_info.as_deref(), Some("Contact the manufacturer."));
        assert_eq!(
            details.attachments,
            vec![
                "Download the field safety notice (https://assets.publishing.service.gov.uk/fsn.pdf)".to_string(),
                "Manufacturer letter (https://www.gov.uk/media/letter.pdf)".to_string(),
            ]
        );
    }

    #[test]
    fn dmrc_references_are_found_in_free_text() {
        assert_eq!(dmrc_reference("Ref: DMRC-123 issued").as_deref(), Some("DMRC-123"));
        assert_eq!(dmrc_reference("DMRC 42").as_deref(), Some("DMRC 42"));
        assert_eq!(dmrc_reference("DMRC:7 and DMRC-8").as_deref(), Some("DMRC:7"));
        assert_eq!(dmrc_reference("the DMRC team, then DMRC99").as_deref(), Some("DMRC99"));
        assert_eq!(dmrc_reference("no reference here"), None);
    }

    #[test]
    fn applying_a_page_keeps_listing_values_it_does_not_carry() {
        let mut draft = AlertDraft::new(alertwatch_core::SourceKind::GovUk, GOVUK_URL, chrono::Utc::now());
        draft.title = Some("Listing title".to_string());
        draft.issue_date = Some("12 March 2024".to_string());
        draft.originator = Some("MHRA/GOV.UK".to_string());

        DetailPage {
            reference: Some("DMRC-1".to_string()),
            ..DetailPage::default()
        }
        .apply_to(&mut draft);
        assert_eq!(draft.title.as_deref(), Some("Listing title"));
        assert_eq!(draft.issue_date.as_deref(), Some("12 March 2024"));
        assert_eq!(draft.reference.as_deref(), Some("DMRC-1"));
        assert_eq!(draft.originator.as_deref(), Some("MHRA/GOV.UK"));
    }
}
