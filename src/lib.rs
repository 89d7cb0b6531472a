//! Shared-fragment composition for static documentation and blog sites.
//!
//! Pages carry placeholder elements (`<div id="header-placeholder"></div>`);
//! a [`composer::FragmentComposer`] fetches the matching fragment once per
//! session, substitutes `{{key}}` placeholders and writes the result into
//! the element.  The `fragkit` binary drives this ahead of time
//! ([`site::build_site`]), per request ([`serve::run_serve`]) or for a single
//! page.

pub mod composer;
pub mod config;
pub mod document;
pub mod error;
pub mod includes;
pub mod paths;
pub mod serve;
pub mod site;
pub mod source;
pub mod template;
