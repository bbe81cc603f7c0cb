//! Security headers (spec.md §4.13). Applied with
//! `SetResponseHeaderLayer::overriding`/`if_not_present` exactly as the
//! framework lineage's own security-headers layer does.

use axum::http::HeaderValue;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::SecurityHeadersConfig;

pub fn apply_security_headers<S>(router: Router<S>, config: &SecurityHeadersConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    if !config.enabled {
        return router;
    }

    let mut router = router;

    if config.hsts {
        let value = format!("max-age={}; includeSubDomains", config.hsts_max_age_secs);
        if let Ok(header) = HeaderValue::from_str(&value) {
            router = router.layer(SetResponseHeaderLayer::if_not_present(
                axum::http::header::STRICT_TRANSPORT_SECURITY,
                header,
            ));
        }
    }

    if config.x_content_type_options {
        router = router.layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ));
    }

    if let Ok(header) = HeaderValue::from_str(&config.x_frame_options) {
        router = router.layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            header,
        ));
    }

    router = router.layer(SetResponseHeaderLayer::overriding(
        axum::http::HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    ));

    if let Ok(header) = HeaderValue::from_str(&config.referrer_policy) {
        router = router.layer(SetResponseHeaderLayer::overriding(
            axum::http::header::REFERRER_POLICY,
            header,
        ));
    }

    router
}
