// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Periodic maintenance: delayed wills, session expiry eviction and the
//! retained message sweep.
//!
//! Keep alive is checked by the connection tasks themselves; a timed out
//! connection simply reports itself gone.

use std::time::Instant;

use super::Dispatcher;
use crate::session::Session;

impl Dispatcher {
    pub(crate) async fn housekeeper(&mut self, now: Instant) {
        // Wills whose delay has elapsed while the session lives on.
        let due_wills: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.will_time().is_some_and(|at| now >= at))
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in due_wills {
            let will = self
                .sessions
                .get_mut(&client_id)
                .and_then(Session::take_will);
            if let Some(will) = will {
                self.publish_will(&client_id, will).await;
            }
        }

        // Expired sessions are evicted, dispatching their will first.
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_expired(now))
            .map(|(client_id, _)| client_id.clone())
            .collect();
        for client_id in expired {
            self.evict_session(&client_id).await;
        }

        self.retain.sweep(now);
    }

    /// Drop a session whose expiry fired, publishing a still pending will.
    pub(crate) async fn evict_session(&mut self, client_id: &str) {
        let will = self
            .sessions
            .get_mut(client_id)
            .and_then(Session::take_will);
        if let Some(will) = will {
            self.publish_will(client_id, will).await;
        }
        log::info!("dispatcher: Session {client_id} expired");
        self.drop_session_state(client_id);
    }
}
