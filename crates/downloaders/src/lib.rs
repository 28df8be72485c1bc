//! Implements the downloader side of chain synchronization: taking the
//! disordered stream of headers peers deliver and assembling it into a
//! verified, contiguous chain extending the persisted tip.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod headers;
