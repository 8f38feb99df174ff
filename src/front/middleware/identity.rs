use ntex::{
    http::{HeaderMap, Payload},
    web::{Error, FromRequest, HttpRequest},
};

use crate::{consts, models::identity::RequestIdentity};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads the caller identity the upstream auth layer left in the headers.
///
/// Missing or unreadable headers resolve to an anonymous identity, the
/// auth gate decides what an anonymous caller may do.
pub fn identity_from_headers(headers: &HeaderMap) -> RequestIdentity {
    let is_api_key = header_str(headers, consts::IDENTITY_API_KEY_HEADER)
        .is_some_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));

    let roles = header_str(headers, consts::IDENTITY_ROLES_HEADER)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|role| !role.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    RequestIdentity {
        is_api_key,
        uid: header_str(headers, consts::IDENTITY_UID_HEADER).map(str::to_string),
        roles,
    }
}

impl<Err> FromRequest<Err> for RequestIdentity {
    type Error = Error;

    fn from_request(
        req: &HttpRequest,
        _: &mut Payload,
    ) -> impl std::future::Future<Output = Result<Self, Self::Error>> {
        futures::future::ready(Ok(identity_from_headers(req.headers())))
    }
}
