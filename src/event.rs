// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use tokio::sync::watch;

/// Cooperative flag the tasks of one session synchronize on.
///
/// Setting and clearing are atomic swaps so state transitions that must
/// happen exactly once can check the previous value.
pub(crate) struct Event {
    flag: watch::Sender<bool>,
}

impl Event {
    /// Create new [`Event`] in the cleared state.
    pub fn new() -> Self {
        Self {
            flag: watch::channel(false).0,
        }
    }

    /// Set the flag, waking every waiter.
    pub fn set(&self) {
        self.flag.send_replace(true);
    }

    /// Clear the flag.
    pub fn clear(&self) {
        self.flag.send_replace(false);
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        *self.flag.borrow()
    }

    /// Clear the flag, returning whether it was set before.
    pub fn clear_if_set(&self) -> bool {
        self.flag.send_replace(false)
    }

    /// Wait until the flag is set.
    pub async fn wait(&self) {
        let mut flag = self.flag.subscribe();

        // the sender lives inside `self` so the channel cannot close
        let _ = flag.wait_for(|set| *set).await;
    }
}
