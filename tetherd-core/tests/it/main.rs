//! Cross-component tests for the tethering control plane, driven end to end
//! against mock collaborators.

mod properties;
mod support;
