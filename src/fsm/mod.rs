pub mod automaton;
pub mod clock;

#[cfg(test)]
mod tests {

    use crate::fsm::automaton::*;
    use crate::fsm::clock::*;
    use crate::primitives::event::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    enum Command {
        HIT,
    }

    #[derive(Debug, Copy, Clone, PartialEq)]
    enum State {
        DEFAULT,
    }

    use self::Command::*;

    impl Default for State {
        fn default() -> State {
            State::DEFAULT
        }
    }

    #[test]
    fn basic_lifecycle() {
        struct FSM {
            cnt: usize,
        }

        impl Recv<Command, State> for FSM {
            fn recv(
                &mut self,
                _this: &Arc<Automaton<Command>>,
                state: State,
                _opcode: Opcode<Command, State>,
            ) -> State {
                self.cnt += 1;
                state
            }
        }

        impl Drop for FSM {
            fn drop(&mut self) -> () {

                //
                // - START + 2 inputs + DRAIN + EXIT
                //
                assert!(self.cnt == 5);
            }
        }

        let event = Event::new();
        let guard = event.guard();
        let fsm = Automaton::spawn(guard.clone(), Box::new(FSM { cnt: 0 }));
        let _ = fsm.post(HIT);
        let _ = fsm.post(HIT);
        drop(guard);
        fsm.drain();
        event.wait();
        assert!(fsm.post(HIT).is_err());
    }

    #[test]
    fn clock_ticks_until_drained() {
        struct FSM {
            ticks: usize,
        }

        impl Recv<Command, State> for FSM {
            fn recv(
                &mut self,
                this: &Arc<Automaton<Command>>,
                state: State,
                opcode: Opcode<Command, State>,
            ) -> State {
                if let Opcode::INPUT(HIT) = opcode {
                    self.ticks += 1;
                    if self.ticks == 3 {
                        this.drain();
                    }
                }
                state
            }
        }

        let event = Event::new();
        let guard = event.guard();
        let fsm = Automaton::spawn(guard.clone(), Box::new(FSM { ticks: 0 }));
        Clock::spawn(&fsm, Duration::from_millis(10), || HIT);
        drop(guard);
        event.wait();
    }
}
