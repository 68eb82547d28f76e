use crate::error::CgiError;

/// Upper bound on internal redirects (CGI local redirects and error-page
/// fetches) for one client request.
pub const MAX_REDIRECTS: usize = 10;

/// Local-redirect depth of one logical request chain. Carried by value from a
/// cycle into the requests it re-dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedirectGuard {
    depth: usize,
}

impl RedirectGuard {
    pub fn new() -> Self {
        RedirectGuard { depth: 0 }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn exhausted(&self) -> bool {
        self.depth >= MAX_REDIRECTS
    }

    /// Records one more internal redirect, refusing once the limit is hit.
    pub fn advance(&mut self) -> Result<(), CgiError> {
        if self.exhausted() {
            return Err(CgiError::RedirectLimit(MAX_REDIRECTS));
        }
        self.depth += 1;
        Ok(())
    }

    /// The guard a nested cycle starts from.
    pub fn child(&self) -> Result<RedirectGuard, CgiError> {
        let mut next = *self;
        next.advance()?;
        Ok(next)
    }
}
