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

use std::{
    borrow::Cow,
    error::Error as ErrorTrait,
    fmt::{self, Debug, Display},
};

pub type BoxError = Box<dyn ErrorTrait + Send + Sync + 'static>;
pub type Result<T> = ::core::result::Result<T, Error>;

/// Type-erased error carrying a chain of context messages.
///
/// `Error` does not implement [`std::error::Error`]. Anything convertible into a [`BoxError`],
/// `&str` and `String` included, converts into it with `?`.
pub struct Error(BoxError);

#[derive(Debug)]
struct WithContext {
    msg: Cow<'static, str>,
    source: BoxError,
}

impl Display for WithContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

impl ErrorTrait for WithContext {
    fn source(&self) -> Option<&(dyn ErrorTrait + 'static)> {
        Some(&*self.source)
    }
}

impl Error {
    #[must_use]
    pub fn context(self, msg: impl Into<Cow<'static, str>>) -> Self {
        Self(Box::new(WithContext { msg: msg.into(), source: self.0 }))
    }

    pub fn inner(&self) -> &(dyn ErrorTrait + Send + Sync + 'static) {
        self.0.as_ref()
    }

    pub fn into_inner(self) -> BoxError {
        self.0
    }

    /// Iterates from the outermost context down to the root cause.
    pub fn chain(&self) -> impl Iterator<Item = &(dyn ErrorTrait + 'static)> {
        let first: &(dyn ErrorTrait + 'static) = &*self.0;
        std::iter::successors(Some(first), |err: &&(dyn ErrorTrait + 'static)| (*err).source())
    }

    pub fn root_cause(&self) -> &(dyn ErrorTrait + 'static) {
        self.chain().last().unwrap_or(&*self.0)
    }

    pub fn downcast_ref<E: ErrorTrait + 'static>(&self) -> Option<&E> {
        self.chain().find_map(|err| err.downcast_ref::<E>())
    }
}

impl<E> From<E> for Error
where
    E: Into<BoxError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chain = self.chain();
        if let Some(first) = chain.next() {
            write!(f, "{first}")?;
        }
        for cause in chain {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return Debug::fmt(&self.0, f);
        }
        Display::fmt(self, f)
    }
}

pub trait Context<T> {
    fn context(self, msg: impl Into<Cow<'static, str>>) -> Result<T>;

    fn with_context_msg(self, msg: impl Into<Cow<'static, str>>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<Cow<'static, str>>;
}

impl<T, E> Context<T> for ::core::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, msg: impl Into<Cow<'static, str>>) -> Result<T> {
        self.map_err(|e| e.into().context(msg))
    }

    fn with_context_msg(self, msg: impl Into<Cow<'static, str>>) -> Result<T> {
        self.context(msg)
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<Cow<'static, str>>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
