use indoc::formatdoc;
use url::Url;

use crate::model::cancellation_action::LinkKind;

const DIRECT_QUERY_MARKERS: [&str; 4] = ["token=", "id=", "email=", "unsubscribe="];
const LOGIN_PATH_MARKERS: [&str; 3] = ["login", "signin", "account"];
const FORM_PATH_MARKERS: [&str; 3] = ["cancel", "manage", "settings"];

/// How a cancellation link can be acted on. Checks run in a fixed order:
/// one-click query parameters, then login walls, then form pages.
pub fn classify_link(url: Option<&str>) -> LinkKind {
    let Some(parsed) = url.and_then(|u| Url::parse(u).ok()) else {
        return LinkKind::Unknown;
    };
    let query = parsed.query().unwrap_or_default().to_lowercase();
    let path = parsed.path().to_lowercase();

    if DIRECT_QUERY_MARKERS.iter().any(|m| query.contains(m)) {
        LinkKind::Direct
    } else if LOGIN_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        LinkKind::LoginRequired
    } else if FORM_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        LinkKind::Form
    } else {
        LinkKind::Unknown
    }
}

pub fn manual_instructions(service_name: &str, url: Option<&str>, reason: &str) -> String {
    match url {
        Some(url) => formatdoc! {"
            We could not cancel {service_name} automatically ({reason}).
            1. Open {url} and sign in if asked.
            2. Look for an option such as \"Cancel subscription\", \"Cancel membership\" or \"Turn off auto-renew\".
            3. Follow the prompts until you see a confirmation, and keep the confirmation email.
            Once the confirmation email arrives we will mark the subscription as cancelled."},
        None => formatdoc! {"
            We could not cancel {service_name} automatically ({reason}).
            No cancellation link was found in your emails.
            1. Sign in to your {service_name} account and open the billing or subscription settings.
            2. If there is no cancel option, contact {service_name} support or your card issuer.
            You can mark the subscription as cancelled once it is done."},
    }
}
