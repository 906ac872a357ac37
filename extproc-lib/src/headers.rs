// Copyright 2025 The kmesh Authors
//
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//

use envoy_types::pb::envoy::{
    config::core::v3::{
        header_value_option::HeaderAppendAction, HeaderMap as EnvoyHeaderMap, HeaderValue as EnvoyHeaderValue,
        HeaderValueOption,
    },
    service::ext_proc::v3::{
        common_response::ResponseStatus, CommonResponse, HeaderMutation as EnvoyHeaderMutation, HeadersResponse,
    },
};

/// A single received header. Keys compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl From<&EnvoyHeaderValue> for Header {
    fn from(header: &EnvoyHeaderValue) -> Self {
        // envoy fills raw_value and leaves value empty unless told otherwise
        let value = if header.raw_value.is_empty() {
            header.value.clone()
        } else {
            String::from_utf8_lossy(&header.raw_value).into_owned()
        };
        Header { key: header.key.clone(), value }
    }
}

/// The headers of one message, in the order they were received. Duplicated keys are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    headers: Vec<Header>,
}

impl HeaderSet {
    pub fn new(headers: Vec<Header>) -> Self {
        Self { headers }
    }

    /// First value whose key matches `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.key.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }
}

impl From<&EnvoyHeaderMap> for HeaderSet {
    fn from(map: &EnvoyHeaderMap) -> Self {
        Self { headers: map.headers.iter().map(Header::from).collect() }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self { headers: iter.into_iter().map(|(key, value)| Header { key: key.into(), value: value.into() }).collect() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendPolicy {
    /// Extend an existing header, add it otherwise.
    #[default]
    AppendIfExistsOrAdd,
    AddIfAbsent,
    OverwriteIfExistsOrAdd,
    OverwriteIfExists,
}

impl From<AppendPolicy> for HeaderAppendAction {
    fn from(policy: AppendPolicy) -> Self {
        match policy {
            AppendPolicy::AppendIfExistsOrAdd => HeaderAppendAction::AppendIfExistsOrAdd,
            AppendPolicy::AddIfAbsent => HeaderAppendAction::AddIfAbsent,
            AppendPolicy::OverwriteIfExistsOrAdd => HeaderAppendAction::OverwriteIfExistsOrAdd,
            AppendPolicy::OverwriteIfExists => HeaderAppendAction::OverwriteIfExists,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetHeader {
    pub key: String,
    pub value: String,
    pub append: AppendPolicy,
}

/// Headers to set and header keys to remove on the request being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMutation {
    pub set: Vec<SetHeader>,
    pub remove: Vec<String>,
}

impl HeaderMutation {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    #[must_use]
    pub fn with_set(mut self, key: impl Into<String>, value: impl Into<String>, append: AppendPolicy) -> Self {
        self.set.push(SetHeader { key: key.into(), value: value.into(), append });
        self
    }

    #[must_use]
    pub fn with_remove(mut self, key: impl Into<String>) -> Self {
        self.remove.push(key.into());
        self
    }
}

impl From<SetHeader> for HeaderValueOption {
    fn from(header: SetHeader) -> Self {
        HeaderValueOption {
            header: Some(EnvoyHeaderValue {
                key: header.key,
                raw_value: header.value.into_bytes(),
                ..Default::default()
            }),
            append_action: HeaderAppendAction::from(header.append).into(),
            ..Default::default()
        }
    }
}

impl From<HeaderMutation> for EnvoyHeaderMutation {
    fn from(mutation: HeaderMutation) -> Self {
        EnvoyHeaderMutation {
            set_headers: mutation.set.into_iter().map(HeaderValueOption::from).collect(),
            remove_headers: mutation.remove,
        }
    }
}

/// What the request-headers phase tells envoy to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub clear_route_cache: bool,
    pub mutation: HeaderMutation,
}

impl ProcessingOutcome {
    /// Leave the request untouched.
    pub fn unmodified() -> Self {
        Self::default()
    }

    pub fn is_unmodified(&self) -> bool {
        !self.clear_route_cache && self.mutation.is_empty()
    }
}

impl From<ProcessingOutcome> for CommonResponse {
    fn from(outcome: ProcessingOutcome) -> Self {
        let ProcessingOutcome { clear_route_cache, mutation } = outcome;
        CommonResponse {
            status: ResponseStatus::Continue.into(),
            header_mutation: (!mutation.is_empty()).then(|| mutation.into()),
            clear_route_cache,
            ..Default::default()
        }
    }
}

impl From<ProcessingOutcome> for HeadersResponse {
    fn from(outcome: ProcessingOutcome) -> Self {
        HeadersResponse { response: Some(outcome.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envoy_header(key: &str, value: &str, raw: bool) -> EnvoyHeaderValue {
        if raw {
            EnvoyHeaderValue { key: key.to_owned(), raw_value: value.as_bytes().to_vec(), ..Default::default() }
        } else {
            EnvoyHeaderValue { key: key.to_owned(), value: value.to_owned(), ..Default::default() }
        }
    }

    #[test]
    fn lookup_ignores_case_and_keeps_first() {
        let map = EnvoyHeaderMap {
            headers: vec![
                envoy_header(":path", "/", true),
                envoy_header("Preferred-Svc", "svc-a", true),
                envoy_header("preferred-svc", "svc-b", false),
            ],
        };
        let headers = HeaderSet::from(&map);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("preferred-svc"), Some("svc-a"));
        assert_eq!(headers.get("PREFERRED-SVC"), Some("svc-a"));
        assert!(!headers.contains("x-routing-decision"));
    }

    #[test]
    fn plain_value_used_when_raw_value_is_empty() {
        let headers = HeaderSet::from(&EnvoyHeaderMap { headers: vec![envoy_header("x-env", "prod", false)] });
        assert_eq!(headers.get("x-env"), Some("prod"));
    }

    #[test]
    fn mutation_becomes_envoy_response() {
        let outcome = ProcessingOutcome {
            clear_route_cache: true,
            mutation: HeaderMutation::default()
                .with_set("x-routing-decision", "svc-a", AppendPolicy::AppendIfExistsOrAdd)
                .with_remove("preferred-svc"),
        };
        let response = HeadersResponse::from(outcome);
        let common = response.response.unwrap();
        assert_eq!(common.status(), ResponseStatus::Continue);
        assert!(common.clear_route_cache);

        let mutation = common.header_mutation.unwrap();
        assert_eq!(mutation.remove_headers, vec!["preferred-svc".to_owned()]);
        assert_eq!(mutation.set_headers.len(), 1);
        let set = &mutation.set_headers[0];
        assert_eq!(set.append_action(), HeaderAppendAction::AppendIfExistsOrAdd);
        let header = set.header.as_ref().unwrap();
        assert_eq!(header.key, "x-routing-decision");
        assert_eq!(header.raw_value, b"svc-a");
    }

    #[test]
    fn unmodified_outcome_has_no_mutation() {
        let outcome = ProcessingOutcome::unmodified();
        assert!(outcome.is_unmodified());
        let common = CommonResponse::from(outcome);
        assert!(common.header_mutation.is_none());
        assert!(!common.clear_route_cache);
    }
}
