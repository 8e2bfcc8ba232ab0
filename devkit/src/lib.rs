/*!
# TrackHub DevKit - Mocks et utilitaires de test

Bibliothèque facilitant le test du pipeline d'ingestion avec:
- Mock broker implémentant le trait `Broker` du kernel
- Builders de messages OwnTracks
- Harness qui fait tourner la vraie boucle de dispatch
*/

pub mod mqtt_stub;
pub mod owntracks;
pub mod test_utils;

pub use mqtt_stub::{MockBroker, MockFailure};
pub use owntracks::OwnTracksMessageBuilder;
pub use test_utils::TestHarness;
