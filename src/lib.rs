//! Agglomerative clustering of B-cell receptor sequence sets, scored by
//! per-cluster V(D)J hidden Markov model likelihoods: a forward pass
//! drives the merge loop, a viterbi pass reconstructs each cluster's
//! rearrangement and naive sequence.

pub mod cli;
pub mod clusterpath;
pub mod dphandler;
pub mod errs;
pub mod germlines;
pub mod glomerator;
pub mod hmm;
pub mod input;
pub mod logging;
pub mod reco_event;
pub mod sequences;
mod trellis;
mod util;
pub mod writers;
